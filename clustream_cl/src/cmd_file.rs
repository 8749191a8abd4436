use clustream::{FileStorage, OpenMode, RecordTraits, StorageOptions, StoragePolicy};

use crate::error::{CliError, CliResult};
use crate::helpers::{close_storage, expect_args, open_storage, parse_size};

const CREATE_USAGE: &str =
    "clustream create <file> [--cluster-size N] [--key-size N] [--reserved N] [--integrity]";

pub fn cmd_create(args: &[String]) -> CliResult {
    if args.is_empty() {
        return Err(CliError::new(format!("Usage: {}", CREATE_USAGE)));
    }

    let path = &args[0];
    let mut options = StorageOptions::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--cluster-size" => {
                i += 1;
                let size = args
                    .get(i)
                    .ok_or_else(|| CliError::new("--cluster-size requires a size argument"))
                    .and_then(|s| parse_size(s))?;
                options.cluster_size = u32::try_from(size)
                    .map_err(|_| CliError::new(format!("Cluster size too large: {}", size)))?;
            }
            "--key-size" => {
                i += 1;
                options.record_key_size = args
                    .get(i)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| CliError::new("--key-size requires a numeric argument"))?;
                options.policy |= StoragePolicy::TRACK_KEY | StoragePolicy::TRACK_CHECKSUMS;
            }
            "--reserved" => {
                i += 1;
                options.reserved_records = args
                    .get(i)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| CliError::new("--reserved requires a numeric argument"))?;
            }
            "--integrity" => options.policy |= StoragePolicy::INTEGRITY_CHECKS,
            other => {
                return Err(CliError::new(format!(
                    "Unknown option: {}. Usage: {}",
                    other, CREATE_USAGE
                )));
            }
        }
        i += 1;
    }

    let storage = FileStorage::create_file(path, options)
        .map_err(|e| CliError::new(format!("Error creating storage file: {}", e)))?;
    let cluster_size = storage.cluster_size();
    close_storage(storage)?;
    println!("Created {} ({}-byte clusters)", path, cluster_size);
    Ok(())
}

pub fn cmd_info(args: &[String]) -> CliResult {
    expect_args(args, 1, "clustream info <file>")?;

    let storage = open_storage(&args[0], OpenMode::Read)?;
    let header = storage.header();
    println!("Version:       {}", header.version);
    println!("Cluster size:  {} bytes", header.cluster_size);
    println!("Clusters:      {}", header.total_clusters);
    println!("Records:       {}", header.records_count);
    println!("Reserved:      {}", header.reserved_records);
    println!("Key size:      {} bytes", header.record_key_size);
    println!("Policy:        {:?}", header.policy);
    close_storage(storage)
}

pub fn cmd_ls(args: &[String]) -> CliResult {
    expect_args(args, 1, "clustream ls <file>")?;

    let storage = open_storage(&args[0], OpenMode::Read)?;
    println!("{:>8}  {:>12}  {:>10}  {:>10}  flags", "index", "size", "start", "end");
    for index in 0..storage.count() {
        let record = storage.record(index)?;
        let mut flags = Vec::new();
        if record.is_null() {
            flags.push("null");
        }
        if record.traits.contains(RecordTraits::IS_USED) {
            flags.push("used");
        }
        println!(
            "{:>8}  {:>12}  {:>10}  {:>10}  {}",
            index,
            record.size,
            record.start,
            record.end,
            flags.join(",")
        );
    }
    close_storage(storage)
}

pub fn cmd_verify(args: &[String]) -> CliResult {
    expect_args(args, 1, "clustream verify <file>")?;

    let storage = open_storage(&args[0], OpenMode::Read)?;
    let issues = storage
        .verify()
        .map_err(|e| CliError::new(format!("Error running verify: {}", e)))?;

    if issues.is_empty() {
        println!("OK: no issues found");
    } else {
        println!("Found {} issue(s):", issues.len());
        for issue in &issues {
            println!("  - {}", issue);
        }
    }

    close_storage(storage)?;
    if issues.is_empty() {
        Ok(())
    } else {
        Err(CliError::new("Verification found issues"))
    }
}

pub fn cmd_clear(args: &[String]) -> CliResult {
    expect_args(args, 1, "clustream clear <file>")?;

    let storage = open_storage(&args[0], OpenMode::Write)?;
    storage
        .clear()
        .map_err(|e| CliError::new(format!("Error clearing storage: {}", e)))?;
    let remaining = storage.count();
    close_storage(storage)?;
    println!("Cleared {} ({} reserved record(s) kept)", args[0], remaining);
    Ok(())
}
