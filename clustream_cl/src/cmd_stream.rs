use std::fs;
use std::io::{self, Write};
use std::time::Instant;

use clustream::OpenMode;

use crate::error::{CliError, CliResult};
use crate::helpers::{close_storage, expect_args, open_storage, parse_index, parse_size, read_record_fully};

fn read_local(path: &str) -> Result<Vec<u8>, CliError> {
    fs::read(path).map_err(|e| CliError::new(format!("Error reading '{}': {}", path, e)))
}

fn rate(bytes: usize, t0: Instant) -> f64 {
    let mb = bytes as f64 / (1024.0 * 1024.0);
    mb / t0.elapsed().as_secs_f64().max(f64::EPSILON)
}

pub fn cmd_put(args: &[String]) -> CliResult {
    expect_args(args, 2, "clustream put <file> <local-file>")?;

    let local_file = &args[1];
    let data = read_local(local_file)?;

    let storage = open_storage(&args[0], OpenMode::Write)?;
    let t0 = Instant::now();
    let mut scope = storage
        .add()
        .map_err(|e| CliError::new(format!("Error adding record: {}", e)))?;
    let index = scope.index();
    scope
        .write_all(&data)
        .map_err(|e| CliError::new(format!("Error writing record {}: {}", index, e)))?;
    scope
        .close()
        .map_err(|e| CliError::new(format!("Error closing record {}: {}", index, e)))?;
    println!(
        "Imported {} bytes from {} as record {} ({:.1} MB/s)",
        data.len(),
        local_file,
        index,
        rate(data.len(), t0)
    );
    close_storage(storage)
}

pub fn cmd_insert(args: &[String]) -> CliResult {
    expect_args(args, 3, "clustream insert <file> <index> <local-file>")?;

    let index = parse_index(&args[1])?;
    let data = read_local(&args[2])?;

    let storage = open_storage(&args[0], OpenMode::Write)?;
    let mut scope = storage
        .insert(index)
        .map_err(|e| CliError::new(format!("Error inserting record {}: {}", index, e)))?;
    scope
        .write_all(&data)
        .map_err(|e| CliError::new(format!("Error writing record {}: {}", index, e)))?;
    scope
        .close()
        .map_err(|e| CliError::new(format!("Error closing record {}: {}", index, e)))?;
    println!("Inserted {} bytes at record {}", data.len(), index);
    close_storage(storage)
}

pub fn cmd_get(args: &[String]) -> CliResult {
    expect_args(args, 3, "clustream get <file> <index> <local-file>")?;

    let index = parse_index(&args[1])?;
    let local_file = &args[2];

    let storage = open_storage(&args[0], OpenMode::Read)?;
    let t0 = Instant::now();
    let buffer = read_record_fully(&storage, index)?;
    let mbps = rate(buffer.len(), t0);
    close_storage(storage)?;

    fs::write(local_file, &buffer)
        .map_err(|e| CliError::new(format!("Error writing '{}': {}", local_file, e)))?;
    println!(
        "Exported {} bytes from record {} to {} ({:.1} MB/s)",
        buffer.len(),
        index,
        local_file,
        mbps
    );
    Ok(())
}

pub fn cmd_cat(args: &[String]) -> CliResult {
    expect_args(args, 2, "clustream cat <file> <index>")?;

    let index = parse_index(&args[1])?;
    let storage = open_storage(&args[0], OpenMode::Read)?;
    let buffer = read_record_fully(&storage, index)?;
    close_storage(storage)?;

    let mut stdout = io::stdout().lock();
    stdout.write_all(&buffer)?;
    stdout.flush()?;
    Ok(())
}

pub fn cmd_rm(args: &[String]) -> CliResult {
    expect_args(args, 2, "clustream rm <file> <index>")?;

    let index = parse_index(&args[1])?;
    let storage = open_storage(&args[0], OpenMode::Write)?;
    storage
        .remove(index)
        .map_err(|e| CliError::new(format!("Error removing record {}: {}", index, e)))?;
    println!("Removed record {} ({} left)", index, storage.count());
    close_storage(storage)
}

pub fn cmd_swap(args: &[String]) -> CliResult {
    expect_args(args, 3, "clustream swap <file> <a> <b>")?;

    let a = parse_index(&args[1])?;
    let b = parse_index(&args[2])?;
    let storage = open_storage(&args[0], OpenMode::Write)?;
    storage
        .swap(a, b)
        .map_err(|e| CliError::new(format!("Error swapping records: {}", e)))?;
    println!("Swapped records {} and {}", a, b);
    close_storage(storage)
}

pub fn cmd_truncate(args: &[String]) -> CliResult {
    expect_args(args, 3, "clustream truncate <file> <index> <len>")?;

    let index = parse_index(&args[1])?;
    let len = parse_size(&args[2])?;
    let storage = open_storage(&args[0], OpenMode::Write)?;
    let mut scope = storage
        .open_write(index)
        .map_err(|e| CliError::new(format!("Error opening record {}: {}", index, e)))?;
    scope
        .set_len(len)
        .map_err(|e| CliError::new(format!("Error resizing record {}: {}", index, e)))?;
    scope
        .close()
        .map_err(|e| CliError::new(format!("Error closing record {}: {}", index, e)))?;
    println!("Record {} is now {} bytes", index, len);
    close_storage(storage)
}
