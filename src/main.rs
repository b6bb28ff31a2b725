use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tend::clock::SystemClock;
use tend::config::{load_config, TendConfig};
use tend::geofence::{
    spawn_cache_reset_task, AlertSender, Coordinates, GeofenceEngine, MailAlertSender,
};
use tend::relationship::{HttpLinkAuthority, LinkAuthority};
use tend::reminders::{spawn_midnight_task, Recurrence, RecurrenceScheduler};
use tend::session::{LoginPayload, PatientSelection, SessionManager};
use tend::store::{RecordStore, SqliteStore};
use tend::{logging, tlog};

const DEFAULT_AUTHORITY_URL: &str = "http://localhost:8800";
const DEFAULT_NOTIFY_URL: &str = "http://localhost:8801/notify";

fn main() {
    logging::init();
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

struct Engine {
    session: SessionManager,
    scheduler: Arc<RecurrenceScheduler>,
    geofence: Arc<GeofenceEngine>,
}

fn build_engine(data_dir: &PathBuf, config: &TendConfig) -> Result<Engine, Box<dyn Error>> {
    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(&data_dir.join("tend.db"))?);
    let clock = Arc::new(SystemClock);
    let timeout = Duration::from_millis(config.verify_timeout_ms);
    let authority: Arc<dyn LinkAuthority> = Arc::new(HttpLinkAuthority::new(
        config
            .authority_url
            .clone()
            .unwrap_or_else(|| DEFAULT_AUTHORITY_URL.to_string()),
        timeout,
    ));
    let sender: Arc<dyn AlertSender> = Arc::new(MailAlertSender::new(
        config
            .notify_url
            .clone()
            .unwrap_or_else(|| DEFAULT_NOTIFY_URL.to_string()),
        timeout,
    ));
    let session = SessionManager::new(store.clone(), clock.clone(), authority);
    let scheduler = Arc::new(RecurrenceScheduler::new(store.clone(), clock.clone()));
    let geofence = Arc::new(GeofenceEngine::new(
        store,
        clock,
        sender,
        config.safe_radius_m,
        config.cache_ttl_ms,
    ));
    Ok(Engine {
        session,
        scheduler,
        geofence,
    })
}

fn run() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let data_dir = env::var("TEND_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("tend-data"));
    std::fs::create_dir_all(&data_dir)?;
    let config = load_config(&data_dir)?;
    let mut engine = build_engine(&data_dir, &config)?;

    match args[1].as_str() {
        "login" => {
            let email = arg_at(&args, 2, "login <email> [patient-email] [token]")?;
            let payload = LoginPayload {
                email: email.clone(),
                patient_email: args.get(3).cloned(),
                token: args.get(4).cloned(),
                ..LoginPayload::default()
            };
            let record = engine.session.login(payload)?;
            println!("logged in as {}", record.email);
            match record.patient_email {
                Some(patient) => println!("linked patient: {patient}"),
                None => println!("no linked patient"),
            }
        }
        "logout" => {
            if engine.session.resume()? {
                engine.session.logout();
                println!("logged out");
            } else {
                println!("nobody is logged in");
            }
        }
        "status" => {
            if !engine.session.resume()? {
                println!("nobody is logged in");
                return Ok(());
            }
            engine.session.refresh_status()?;
            if let Some(record) = engine.session.current() {
                println!("caregiver: {}", record.email);
                println!(
                    "linked patient: {}",
                    record.patient_email.as_deref().unwrap_or("-")
                );
            }
            match engine.session.active_patient() {
                Some(pointer) => println!("active patient: {}", pointer.patient_email),
                None => println!("active patient: -"),
            }
        }
        "patient" => run_patient_command(&mut engine, &args)?,
        "home" => {
            let actor = arg_at(&args, 2, "home <actor-email> <lat> <lon> [--by-caregiver]")?;
            let coords = parse_coords(&args, 3)?;
            let by_caregiver = args.iter().any(|a| a == "--by-caregiver");
            engine.geofence.set_home_anchor(&actor, coords, by_caregiver)?;
            println!("home anchor set for {actor}");
        }
        "track" => {
            let actor = arg_at(&args, 2, "track <actor-email> <lat> <lon>")?;
            let coords = parse_coords(&args, 3)?;
            match engine.geofence.record_location(&actor, coords)? {
                Some(status) => println!("{actor}: {status}"),
                None => println!("{actor}: no home anchor set"),
            }
        }
        "reminder" => run_reminder_command(&engine, &args)?,
        "verify" => {
            let patient = arg_at(&args, 2, "verify <patient-email>")?;
            engine.session.resume()?;
            let token = engine
                .session
                .current()
                .and_then(|r| r.token.clone());
            let timeout = Duration::from_millis(config.verify_timeout_ms);
            let authority = HttpLinkAuthority::new(
                config
                    .authority_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_AUTHORITY_URL.to_string()),
                timeout,
            );
            let result = authority.check_link(&patient, token.as_deref());
            println!("{patient}: {result}");
        }
        "watch" => run_watch(engine)?,
        other => {
            eprintln!("unknown command: {other}");
            print_usage();
        }
    }
    Ok(())
}

fn run_patient_command(engine: &mut Engine, args: &[String]) -> Result<(), Box<dyn Error>> {
    let sub = arg_at(args, 2, "patient <link|set|clear> ...")?;
    if !engine.session.resume()? {
        return Err("log in first".into());
    }
    match sub.as_str() {
        "link" => {
            let email = arg_at(args, 3, "patient link <email> [name]")?;
            engine.session.link_patient(&email, args.get(4).cloned())?;
            println!("linked {email}");
        }
        "set" => {
            let email = arg_at(args, 3, "patient set <email> [name]")?;
            engine.session.set_active_patient(Some(PatientSelection {
                email: email.clone(),
                name: args.get(4).cloned(),
            }))?;
            println!("active patient: {email}");
        }
        "clear" => {
            engine.session.clear_active_patient()?;
            println!("active patient cleared");
        }
        other => return Err(format!("unknown patient subcommand: {other}").into()),
    }
    Ok(())
}

fn run_reminder_command(engine: &Engine, args: &[String]) -> Result<(), Box<dyn Error>> {
    let sub = arg_at(args, 2, "reminder <add|list|complete|ensure-today> ...")?;
    let patient = arg_at(args, 3, "reminder <sub> <patient-email> ...")?;
    match sub.as_str() {
        "add" => {
            let title = arg_at(args, 4, "reminder add <patient> <title> <HH:MM> [daily|weekly|none]")?;
            let time = arg_at(args, 5, "reminder add <patient> <title> <HH:MM> [daily|weekly|none]")?;
            let recurrence = match args.get(6).map(String::as_str) {
                Some("daily") => Recurrence::Daily,
                Some("weekly") => Recurrence::Weekly,
                Some("none") | None => Recurrence::None,
                Some(other) => return Err(format!("unknown recurrence: {other}").into()),
            };
            let days = args.get(7..).unwrap_or_default().to_vec();
            let reminder = engine
                .scheduler
                .add_reminder(&patient, &title, &time, recurrence, days)?;
            println!("added reminder {}", reminder.id);
        }
        "list" => {
            for reminder in engine.scheduler.list(&patient)? {
                let date = reminder
                    .date
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let done = if reminder.completed { "x" } else { " " };
                println!(
                    "[{done}] {date} {} {} ({:?}) id={}",
                    reminder.time, reminder.title, reminder.recurrence, reminder.id
                );
            }
        }
        "complete" => {
            let id = arg_at(args, 4, "reminder complete <patient> <id> [completed-by]")?;
            let by = args
                .get(5)
                .cloned()
                .unwrap_or_else(|| "caregiver".to_string());
            engine.scheduler.complete(&patient, &id, &by)?;
            println!("completed {id}");
        }
        "ensure-today" => {
            let created = engine.scheduler.ensure_today(&patient)?;
            println!("created {created} instance(s)");
        }
        other => return Err(format!("unknown reminder subcommand: {other}").into()),
    }
    Ok(())
}

/// Long-running mode: keeps the midnight rollover task armed for the active
/// patient until Ctrl-C.
fn run_watch(mut engine: Engine) -> Result<(), Box<dyn Error>> {
    if !engine.session.resume()? {
        return Err("log in first".into());
    }
    let active = engine.session.watch_active_patient();
    let cache_watch = engine.session.watch_active_patient();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        if let Some(patient) = active.borrow().clone() {
            match engine.scheduler.ensure_today(&patient) {
                Ok(count) => tlog!("watch: ensured today, {count} new instance(s)"),
                Err(err) => tlog!("watch: ensure-today failed: {err}"),
            }
        }
        let midnight = spawn_midnight_task(engine.scheduler.clone(), active);
        let cache_reset = spawn_cache_reset_task(engine.geofence.clone(), cache_watch);
        tlog!("watch: midnight task armed, Ctrl-C to stop");
        let _ = tokio::signal::ctrl_c().await;
        midnight.cancel();
        cache_reset.cancel();
        tlog!("watch: stopped");
    });
    Ok(())
}

fn arg_at(args: &[String], index: usize, usage: &str) -> Result<String, Box<dyn Error>> {
    args.get(index)
        .cloned()
        .ok_or_else(|| format!("usage: tend {usage}").into())
}

fn parse_coords(args: &[String], index: usize) -> Result<Coordinates, Box<dyn Error>> {
    let latitude: f64 = arg_at(args, index, "... <lat> <lon>")?.parse()?;
    let longitude: f64 = arg_at(args, index + 1, "... <lat> <lon>")?.parse()?;
    if !(-90.0..=90.0).contains(&latitude) {
        return Err("latitude out of range".into());
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err("longitude out of range".into());
    }
    Ok(Coordinates {
        latitude,
        longitude,
    })
}

fn print_usage() {
    println!("tend — caregiver companion engine");
    println!();
    println!("usage: tend <command> [args]");
    println!();
    println!("  login <email> [patient-email] [token]   log in (merges stored record)");
    println!("  logout                                  end the session");
    println!("  status                                  show session and active patient");
    println!("  patient link <email> [name]             link a patient to this caregiver");
    println!("  patient set <email> [name]              select the active patient");
    println!("  patient clear                           clear the active patient");
    println!("  home <actor> <lat> <lon> [--by-caregiver]  set a home anchor");
    println!("  track <actor> <lat> <lon>               record a location and classify it");
    println!("  reminder add <patient> <title> <HH:MM> [daily|weekly|none] [days..]");
    println!("  reminder list <patient>");
    println!("  reminder complete <patient> <id> [completed-by]");
    println!("  reminder ensure-today <patient>");
    println!("  verify <patient-email>                  ask the authority about the link");
    println!("  watch                                   keep the midnight rollover armed");
    println!();
    println!("data directory: $TEND_DATA_DIR (default ./tend-data)");
}
