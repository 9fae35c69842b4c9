//! kvsql Stress Test Binary
//!
//! Hammers a store with concurrent read-modify-write loops while watchers
//! consume the change feed, then checks the revision and delivery invariants.
//! Run with: `cargo run --bin stress_test -- [OPTIONS]`
//!
//! # Examples
//!
//! ```bash
//! # Default: 100 keys, 1000 writes, 10 writer tasks, 2 watchers
//! cargo run --release --bin stress_test
//!
//! # Same-key contention: every writer fights over one revision
//! cargo run --release --bin stress_test -- --same-key --ops 500 --concurrency 20
//!
//! # Encrypted values, verbose logs
//! RUST_LOG=kvsql=debug cargo run --release --bin stress_test -- --encrypt
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use kvsql::{
    EncryptingTransformer, EnvKeyProvider, Error, EventKind, IdentityTransformer, Store,
    StoreConfig, ValueTransformer,
};
use tracing_subscriber::EnvFilter;

/// Stress test configuration
struct Config {
    /// Number of distinct keys
    num_keys: usize,
    /// Successful writes to perform in total
    num_ops: usize,
    /// Concurrent writer tasks
    concurrency: usize,
    /// Concurrent watchers on the whole keyspace
    watchers: usize,
    /// All writers target one key
    same_key: bool,
    /// Store values through the encrypting transformer
    encrypt: bool,
    /// Path to database file (or temp if None)
    db_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_keys: 100,
            num_ops: 1000,
            concurrency: 10,
            watchers: 2,
            same_key: false,
            encrypt: false,
            db_path: None,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--keys" | "-k" => {
                i += 1;
                config.num_keys = args[i].parse().expect("Invalid --keys value");
            }
            "--ops" | "-o" => {
                i += 1;
                config.num_ops = args[i].parse().expect("Invalid --ops value");
            }
            "--concurrency" | "-c" => {
                i += 1;
                config.concurrency = args[i].parse().expect("Invalid --concurrency value");
            }
            "--watchers" | "-w" => {
                i += 1;
                config.watchers = args[i].parse().expect("Invalid --watchers value");
            }
            "--same-key" => {
                config.same_key = true;
            }
            "--encrypt" => {
                config.encrypt = true;
            }
            "--db" | "-d" => {
                i += 1;
                config.db_path = Some(args[i].clone());
            }
            "--help" | "-h" => {
                println!(
                    r#"kvsql Stress Test

Usage: stress_test [OPTIONS]

Options:
  -k, --keys <N>        Number of distinct keys (default: 100)
  -o, --ops <N>         Successful writes in total (default: 1000)
  -c, --concurrency <N> Concurrent writer tasks (default: 10)
  -w, --watchers <N>    Concurrent watchers (default: 2)
  --same-key            All writers contend on one key
  --encrypt             Encrypt values (AES-256-GCM)
  -d, --db <PATH>       Database path (default: temp file)
  -h, --help            Show this help
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn stress_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    for (i, b) in key.iter_mut().enumerate() {
        *b = i as u8;
    }
    key
}

/// One successful write: create if absent, otherwise update at the revision
/// just read. Returns how many conflicts it took.
async fn write_once(store: &Store, key: &str, payload: &[u8]) -> kvsql::Result<u64> {
    let mut conflicts = 0;
    loop {
        let result = match store.get(key).await? {
            None => store.create(key, payload).await.map(|_| ()),
            Some(kv) => store.update(key, payload, kv.revision).await.map(|_| ()),
        };

        match result {
            Ok(()) => return Ok(conflicts),
            Err(Error::RevisionConflict { .. }) | Err(Error::AlreadyExists { .. }) => {
                conflicts += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[tokio::main]
async fn main() -> kvsql::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kvsql=warn")),
        )
        .init();

    let config = parse_args();

    println!("kvsql Stress Test");
    println!("=================");
    println!("Keys:        {}", if config.same_key { 1 } else { config.num_keys });
    println!("Writes:      {}", config.num_ops);
    println!("Concurrency: {}", config.concurrency);
    println!("Watchers:    {}", config.watchers);
    println!(
        "Mode:        {}",
        if config.same_key {
            "Same-key contention"
        } else {
            "Multi-key"
        }
    );
    println!("Values:      {}", if config.encrypt { "encrypted" } else { "plain" });
    println!();

    let temp_dir = std::env::temp_dir().join(format!("kvsql-stress-{}", std::process::id()));
    std::fs::create_dir_all(&temp_dir).expect("create temp dir");
    let db_path = config
        .db_path
        .clone()
        .unwrap_or_else(|| temp_dir.join("stress.db").to_string_lossy().to_string());

    println!("Database:    {}", db_path);
    println!();

    let transformer: Arc<dyn ValueTransformer> = if config.encrypt {
        Arc::new(EncryptingTransformer::new(EnvKeyProvider::from_key(stress_key())))
    } else {
        Arc::new(IdentityTransformer)
    };

    let store_config = StoreConfig::sqlite(&db_path)
        .with_key_prefix("/stress/")
        .with_event_queue_size(10_000)
        .with_watcher_buffer_size(10_000);
    let store = Store::open_with_transformer(store_config, transformer).await?;

    // Watchers count events and record the revision sequence per key.
    let mut watcher_handles = Vec::new();
    for _ in 0..config.watchers {
        let mut watch = store.watch("")?;
        watcher_handles.push(tokio::spawn(async move {
            let mut received = 0u64;
            let mut last_rev: HashMap<String, u64> = HashMap::new();
            let mut out_of_order = 0u64;

            while let Some(event) = watch.next().await {
                let Ok(event) = event else { continue };
                received += 1;
                if event.kind() == EventKind::Deleted {
                    continue;
                }
                if let Some(current) = event.current() {
                    let rev = current.revision.as_raw();
                    let prev = last_rev.insert(current.key.clone(), rev).unwrap_or(0);
                    if rev != prev + 1 {
                        out_of_order += 1;
                    }
                }
            }
            (received, out_of_order)
        }));
    }

    let writes = Arc::new(AtomicU64::new(0));
    let conflicts = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));

    println!("Starting stress test...");
    let start = Instant::now();

    let mut handles = Vec::new();
    let ops_per_task = config.num_ops / config.concurrency.max(1);

    for task_id in 0..config.concurrency {
        let store = store.clone();
        let writes = writes.clone();
        let conflicts = conflicts.clone();
        let errors = errors.clone();
        let num_keys = config.num_keys.max(1);
        let same_key = config.same_key;

        handles.push(tokio::spawn(async move {
            for i in 0..ops_per_task {
                let key = if same_key {
                    "contended".to_string()
                } else {
                    format!("key-{}", (task_id * ops_per_task + i) % num_keys)
                };
                let payload = format!("value-{}-{}", task_id, i);

                match write_once(&store, &key, payload.as_bytes()).await {
                    Ok(c) => {
                        writes.fetch_add(1, Ordering::Relaxed);
                        conflicts.fetch_add(c, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "write failed");
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }

    for handle in handles {
        handle.await.expect("writer task panicked");
    }

    let elapsed = start.elapsed();

    let written = writes.load(Ordering::Relaxed);
    let conflict_count = conflicts.load(Ordering::Relaxed);
    let error_count = errors.load(Ordering::Relaxed);

    println!();
    println!("Results");
    println!("-------");
    println!("Writes:          {}", written);
    println!("Conflicts:       {}", conflict_count);
    println!("Errors:          {}", error_count);
    println!("Duration:        {:?}", elapsed);
    println!(
        "Throughput:      {:.2} writes/sec",
        written as f64 / elapsed.as_secs_f64()
    );
    println!();

    println!("Verifying invariants...");

    // Every successful write is exactly one revision step on some key.
    let records = store.list("").await?;
    let revision_sum: u64 = records.iter().map(|kv| kv.revision.as_raw()).sum();
    println!("  Keys in store:     {}", records.len());
    assert_eq!(
        revision_sum, written,
        "Revision sum mismatch: {} across keys, {} writes",
        revision_sum, written
    );
    println!("  Revisions:         sum matches writes ✓");

    let stats = store.watch_stats();
    store.shutdown().await;

    for (i, handle) in watcher_handles.into_iter().enumerate() {
        let (received, out_of_order) = handle.await.expect("watcher task panicked");
        println!(
            "  Watcher {}:         {} events, {} out of order",
            i, received, out_of_order
        );
        if stats.evictions == 0 && stats.overflows == 0 {
            assert_eq!(received, written, "watcher {} missed events", i);
            assert_eq!(out_of_order, 0, "watcher {} saw revisions out of order", i);
        }
    }
    println!(
        "  Watch hub:         {} evictions, {} overflows",
        stats.evictions, stats.overflows
    );

    println!();
    println!("Stress test PASSED ✓");
    Ok(())
}
