use docshard::offline;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "oplog" => match args.get(2).map(String::as_str) {
            Some("dump") => cmd_oplog_dump(&args[3..]),
            Some("verify") => cmd_oplog_verify(&args[3..]),
            Some(other) => Err(format!("unknown oplog command: {other}")),
            None => Err("missing oplog subcommand".into()),
        },
        "sessions" => match args.get(2).map(String::as_str) {
            Some("list") => cmd_sessions_list(&args[3..]),
            Some(other) => Err(format!("unknown sessions command: {other}")),
            None => Err("missing sessions subcommand".into()),
        },
        other => {
            print_usage();
            Err(format!("unknown top-level command: {other}"))
        }
    }
}

fn cmd_oplog_dump(args: &[String]) -> Result<(), String> {
    let dir = parse_flag_value(args, "--dir").ok_or("--dir is required")?;
    let entries = offline::dump_oplog(Path::new(&dir)).map_err(|e| format!("dump oplog: {e}"))?;
    for entry in &entries {
        let line = serde_json::to_string(entry).map_err(|e| format!("encode entry: {e}"))?;
        println!("{line}");
    }
    Ok(())
}

fn cmd_oplog_verify(args: &[String]) -> Result<(), String> {
    let dir = parse_flag_value(args, "--dir").ok_or("--dir is required")?;
    let report = offline::verify_oplog(Path::new(&dir)).map_err(|e| format!("verify oplog: {e}"))?;
    println!(
        "{}\t{}\t{}\t{}\t{}",
        if report.ok { "ok" } else { "violations" },
        report.entries,
        report.writes,
        report.chained_writes,
        report.last_ts
    );
    for v in &report.violations {
        println!("violation\t{v}");
    }
    if report.ok {
        Ok(())
    } else {
        Err("oplog violations found".into())
    }
}

fn cmd_sessions_list(args: &[String]) -> Result<(), String> {
    let dir = parse_flag_value(args, "--dir").ok_or("--dir is required")?;
    let sessions = offline::list_sessions(Path::new(&dir)).map_err(|e| format!("list sessions: {e}"))?;
    for (session, record) in sessions {
        println!(
            "{}\t{}\t{}\t{}",
            session, record.txn_number, record.write_ts, record.reply.n
        );
    }
    Ok(())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|idx| args.get(idx + 1).cloned())
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  docshard oplog dump --dir <shard-dir>");
    eprintln!("  docshard oplog verify --dir <shard-dir>");
    eprintln!("  docshard sessions list --dir <shard-dir>");
}
