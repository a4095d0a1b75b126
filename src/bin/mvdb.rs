use mvdb::offline;
use std::path::Path;

fn main() {
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
        "tables" => cmd_tables(&args[2..]),
        "verify" => cmd_verify(&args[2..]),
        "prune" => cmd_prune(&args[2..]),
        other => {
            print_usage();
            Err(format!("unknown command: {other}"))
        }
    }
}

fn cmd_tables(args: &[String]) -> Result<(), String> {
    let data_dir = parse_flag_value(args, "--data-dir").ok_or("--data-dir is required")?;
    let include_deleted = args.iter().any(|a| a == "--all");
    let tables =
        offline::list_tables(Path::new(&data_dir)).map_err(|e| format!("tables: {e}"))?;
    for table in tables {
        if table.deleted && !include_deleted {
            continue;
        }
        println!(
            "{}\t{}\t{}\t{}\t{}{}",
            table.name,
            table.kind,
            table.version,
            table.files,
            table.bytes,
            if table.deleted { "\tdeleted" } else { "" }
        );
    }
    Ok(())
}

fn cmd_verify(args: &[String]) -> Result<(), String> {
    let data_dir = parse_flag_value(args, "--data-dir").ok_or("--data-dir is required")?;
    let report =
        offline::verify_local(Path::new(&data_dir)).map_err(|e| format!("verify: {e}"))?;
    println!(
        "{}\t{}\t{}",
        if report.ok { "ok" } else { "violations" },
        report.table_count,
        report.checked_files
    );
    for v in &report.violations {
        println!("violation\t{v}");
    }
    if report.ok {
        Ok(())
    } else {
        Err("verification failed".into())
    }
}

fn cmd_prune(args: &[String]) -> Result<(), String> {
    let data_dir = parse_flag_value(args, "--data-dir").ok_or("--data-dir is required")?;
    let report = offline::prune_local(Path::new(&data_dir)).map_err(|e| format!("prune: {e}"))?;
    for path in &report.removed {
        println!("removed\t{}", path.display());
    }
    println!("live\t{}", report.live.len());
    Ok(())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    for idx in 0..args.len() {
        if args[idx] == flag {
            return args.get(idx + 1).cloned();
        }
    }
    None
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  mvdb tables --data-dir <dir> [--all]");
    eprintln!("  mvdb verify --data-dir <dir>");
    eprintln!("  mvdb prune --data-dir <dir>");
}
