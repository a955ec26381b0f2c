use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use chrono::{TimeDelta, Utc};
use stash::disk::{STASH_FORMAT_VERSION, STASH_HEADER_LEN, decode_file};
use stash::{CacheEntry, DEFAULT_TTL};

fn parse_ttl(hours: &str) -> Result<TimeDelta, String> {
    let hours = hours
        .parse::<i64>()
        .map_err(|e| format!("ttl-hours must be a whole number of hours ({e})"))?;
    TimeDelta::try_hours(hours).ok_or_else(|| format!("ttl-hours {hours} is out of range"))
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args.len() > 3 {
        eprintln!("Usage: {} <path-to-stash-file> [ttl-hours]", args[0]);
        eprintln!("\nExample: {} ./stash%3Aroster%3Aowner.stash 24", args[0]);
        std::process::exit(1);
    }

    let file_path = PathBuf::from(&args[1]);
    let ttl = match args.get(2) {
        Some(hours) => match parse_ttl(hours) {
            Ok(ttl) => ttl,
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        },
        None => DEFAULT_TTL,
    };

    let mut file = match File::open(&file_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", file_path.display(), e);
            std::process::exit(1);
        }
    };

    let mut bytes = Vec::new();
    if let Err(e) = file.read_to_end(&mut bytes) {
        eprintln!("Error reading file '{}': {}", file_path.display(), e);
        std::process::exit(1);
    }

    println!("StashScope - Local Cache Entry Analyzer");
    println!("=======================================");
    println!("File: {}", file_path.display());
    println!(
        "Size: {} bytes ({:.2} KB)",
        bytes.len(),
        bytes.len() as f64 / 1024.0
    );
    println!();

    println!("Header:");
    println!("-------");
    let payload = match decode_file(&bytes) {
        Ok(payload) => {
            println!("  Format version: {STASH_FORMAT_VERSION}");
            println!("  Header length: {STASH_HEADER_LEN} bytes");
            payload
        }
        Err(reason) => {
            println!("  ❌ Invalid header: {reason}");
            println!("  This entry would be purged on the next read.");
            std::process::exit(2);
        }
    };
    println!();

    println!("Entry:");
    println!("------");
    let entry = match CacheEntry::peek(payload) {
        Ok(entry) => entry,
        Err(e) => {
            println!("  ❌ Payload is not a cache entry: {e}");
            println!("  This entry would be purged on the next read.");
            std::process::exit(2);
        }
    };

    let age = Utc::now() - entry.last_updated;
    println!("  Owner: {}", entry.owner_id);
    println!("  Schema version: {}", entry.version);
    println!("  Last updated: {}", entry.last_updated.to_rfc3339());
    println!(
        "  Age: {}h {}m",
        age.num_hours(),
        age.num_minutes() - age.num_hours() * 60
    );
    match entry.item_count() {
        Some(count) => println!("  Items: {count}"),
        None => println!("  ⚠️  Data is not a list"),
    }

    if let Some(items) = entry.data.as_array() {
        println!();
        println!("Items:");
        println!("------");
        for (i, item) in items.iter().enumerate() {
            let id = item
                .get("id")
                .map(|id| id.to_string())
                .unwrap_or_else(|| "<no id>".to_string());
            let item_str =
                serde_json::to_string(item).unwrap_or_else(|_| "Invalid JSON".to_string());
            let preview = if item_str.len() > 100 {
                // Safely truncate at a character boundary
                let mut end = 100;
                while !item_str.is_char_boundary(end) && end > 0 {
                    end -= 1;
                }
                format!("{}...", &item_str[..end])
            } else {
                item_str
            };
            println!("  Item {i}: id {id}");
            println!("    Data: {preview}");
        }
    }

    println!();
    println!("Summary:");
    println!("--------");
    if age > ttl {
        println!("  ❌ Entry is older than the {}h TTL and would be purged", ttl.num_hours());
    } else {
        println!("  ✅ Entry is within the {}h TTL", ttl.num_hours());
    }
    if entry.item_count().is_none() {
        println!("  ❌ Entry data is malformed and would be purged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ttl() {
        assert_eq!(parse_ttl("48"), Ok(TimeDelta::hours(48)));
        assert!(parse_ttl("soon").is_err());
        assert!(parse_ttl("9000000000000000").is_err());
    }
}
