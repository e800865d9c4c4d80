use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use clap::Parser;
use shardcache::{
    now_secs, Cache, ConnHandler, ConnState, Handoff, Settings, StoreOutcome, Transport,
    WorkerContext, WorkerPool, EV_PERSIST, EV_READ,
};

/// Serve a durable in-memory cache over a line protocol.
#[derive(Parser, Debug)]
#[command(name = "shardcache-cli", about = "Durable sharded key-value cache server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:11311")]
    listen: String,

    /// Worker thread count
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Directory for the snapshot and log files
    #[arg(long, default_value = "shardcache-data")]
    data_dir: std::path::PathBuf,

    /// Seconds between snapshot-eligibility checks
    #[arg(long, default_value_t = 60)]
    snapshot_period: u64,

    /// Mutations required before a snapshot is taken
    #[arg(long, default_value_t = 1000)]
    snapshot_changes: u64,

    /// Per-shard item capacity; omit for unbounded
    #[arg(long)]
    shard_capacity: Option<usize>,

    /// Largest accepted value in bytes
    #[arg(long, default_value_t = 1_048_576)]
    max_item_size: usize,
}

/// Worker stats blocks, published once the pool is up so connection threads
/// can aggregate them for the `stats` command.
static WORKER_STATS: OnceLock<Vec<Arc<shardcache::StatsBlock>>> = OnceLock::new();

fn main() {
    env_logger::init();
    let args = Args::parse();

    let settings = Settings {
        num_threads: args.threads,
        snapshot_period: Duration::from_secs(args.snapshot_period),
        snapshot_change_threshold: args.snapshot_changes,
        data_dir: args.data_dir,
        shard_capacity: args.shard_capacity,
        max_item_size: args.max_item_size,
    };

    let cache = Arc::new(Cache::open(settings).unwrap_or_else(|e| {
        eprintln!("Error opening cache: {e}");
        std::process::exit(1);
    }));

    let handler: Arc<ConnHandler> = {
        let cache = Arc::clone(&cache);
        Arc::new(move |handoff: Handoff, ctx: &WorkerContext| {
            let Transport::Tcp(stream) = handoff.transport else {
                log::error!("udp transport is not served by this binary");
                return;
            };
            let cache = Arc::clone(&cache);
            let stats = ctx.stats_handle();
            let worker = ctx.index();
            // Serving on a separate thread keeps the worker's notify loop
            // responsive to mode-switch commands.
            let spawned = std::thread::Builder::new()
                .name(format!("shardcache-conn-{worker}"))
                .spawn(move || {
                    if let Err(e) = serve_conn(&cache, stream, &stats) {
                        log::debug!("connection closed: {e}");
                    }
                });
            if let Err(e) = spawned {
                log::error!("cannot spawn connection thread: {e}");
            }
        })
    };

    let pool = WorkerPool::spawn(
        cache.settings().num_threads,
        handler,
        Arc::clone(cache.global_stats()),
    )
    .unwrap_or_else(|e| {
        eprintln!("Error starting workers: {e}");
        std::process::exit(1);
    });
    let _ = WORKER_STATS.set(pool.stats_handles());

    let listener = TcpListener::bind(&args.listen).unwrap_or_else(|e| {
        eprintln!("Error binding {}: {e}", args.listen);
        std::process::exit(1);
    });
    log::info!("listening on {} with {} workers", args.listen, pool.num_workers());

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                pool.dispatch(Handoff {
                    transport: Transport::Tcp(stream),
                    init_state: ConnState::NewCommand,
                    event_flags: EV_READ | EV_PERSIST,
                    read_buffer_size: 2048,
                });
            }
            Err(e) => log::error!("accept failed: {e}"),
        }
    }
}

/// Absolute expiration from a relative ttl argument; 0 stays "never".
fn exptime_from_ttl(ttl: u32) -> u32 {
    if ttl == 0 {
        0
    } else {
        now_secs().saturating_add(ttl)
    }
}

fn serve_conn(
    cache: &Cache,
    stream: TcpStream,
    stats: &shardcache::StatsBlock,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let parts: Vec<&str> = line.trim_end().split_whitespace().collect();
        let Some(&command) = parts.first() else { continue };

        match command {
            "get" | "gets" => {
                let with_cas = command == "gets";
                for key in &parts[1..] {
                    stats.lock().get_cmds += 1;
                    match cache.get(key.as_bytes()) {
                        Some(it) => {
                            stats.lock().get_hits += 1;
                            if with_cas {
                                write!(
                                    writer,
                                    "VALUE {key} {} {} {}\r\n",
                                    it.flags,
                                    it.value.len(),
                                    it.cas
                                )?;
                            } else {
                                write!(writer, "VALUE {key} {} {}\r\n", it.flags, it.value.len())?;
                            }
                            writer.write_all(&it.value)?;
                            writer.write_all(b"\r\n")?;
                        }
                        None => {
                            stats.lock().get_misses += 1;
                        }
                    }
                }
                writer.write_all(b"END\r\n")?;
            }
            "set" | "add" | "replace" | "cas" => {
                let wants = if command == "cas" { 6 } else { 5 };
                if parts.len() != wants {
                    writer.write_all(b"CLIENT_ERROR bad command line\r\n")?;
                    continue;
                }
                let (key, fields) = (parts[1], &parts[2..]);
                let parsed = (
                    fields[0].parse::<u32>(),
                    fields[1].parse::<u32>(),
                    fields[2].parse::<usize>(),
                );
                let (Ok(flags), Ok(ttl), Ok(nbytes)) = parsed else {
                    writer.write_all(b"CLIENT_ERROR bad command line\r\n")?;
                    continue;
                };
                let mut value = vec![0u8; nbytes];
                reader.read_exact(&mut value)?;
                let mut crlf = [0u8; 2];
                reader.read_exact(&mut crlf)?;

                stats.lock().set_cmds += 1;
                let exptime = exptime_from_ttl(ttl);
                let outcome = match command {
                    "set" => cache.set(key.as_bytes(), &value, flags, exptime).map(|_| StoreOutcome::Stored),
                    "add" => cache.add(key.as_bytes(), &value, flags, exptime),
                    "replace" => cache.replace(key.as_bytes(), &value, flags, exptime),
                    _ => match fields[3].parse::<u64>() {
                        Ok(token) => cache.cas(key.as_bytes(), &value, flags, exptime, token),
                        Err(_) => {
                            writer.write_all(b"CLIENT_ERROR bad cas token\r\n")?;
                            continue;
                        }
                    },
                };
                match outcome {
                    Ok(StoreOutcome::Stored) => writer.write_all(b"STORED\r\n")?,
                    Ok(StoreOutcome::NotStored) => writer.write_all(b"NOT_STORED\r\n")?,
                    Ok(StoreOutcome::Exists) => {
                        stats.lock().cas_badval += 1;
                        writer.write_all(b"EXISTS\r\n")?;
                    }
                    Ok(StoreOutcome::NotFound) => {
                        stats.lock().cas_misses += 1;
                        writer.write_all(b"NOT_FOUND\r\n")?;
                    }
                    Err(e) => write!(writer, "SERVER_ERROR {e}\r\n")?,
                }
            }
            "delete" => {
                let Some(key) = parts.get(1) else {
                    writer.write_all(b"CLIENT_ERROR bad command line\r\n")?;
                    continue;
                };
                stats.lock().delete_cmds += 1;
                if cache.delete(key.as_bytes()) {
                    writer.write_all(b"DELETED\r\n")?;
                } else {
                    stats.lock().delete_misses += 1;
                    writer.write_all(b"NOT_FOUND\r\n")?;
                }
            }
            "touch" => {
                let (Some(key), Some(Ok(ttl))) =
                    (parts.get(1), parts.get(2).map(|t| t.parse::<u32>()))
                else {
                    writer.write_all(b"CLIENT_ERROR bad command line\r\n")?;
                    continue;
                };
                stats.lock().touch_cmds += 1;
                if cache.touch(key.as_bytes(), exptime_from_ttl(ttl)) {
                    writer.write_all(b"TOUCHED\r\n")?;
                } else {
                    stats.lock().touch_misses += 1;
                    writer.write_all(b"NOT_FOUND\r\n")?;
                }
            }
            "incr" | "decr" => {
                let (Some(key), Some(Ok(delta))) =
                    (parts.get(1), parts.get(2).map(|d| d.parse::<u64>()))
                else {
                    writer.write_all(b"CLIENT_ERROR bad command line\r\n")?;
                    continue;
                };
                let incr = command == "incr";
                let result = if incr {
                    cache.incr(key.as_bytes(), delta)
                } else {
                    cache.decr(key.as_bytes(), delta)
                };
                match result {
                    Ok(Some(value)) => write!(writer, "{value}\r\n")?,
                    Ok(None) => {
                        if incr {
                            stats.lock().incr_misses += 1;
                        } else {
                            stats.lock().decr_misses += 1;
                        }
                        writer.write_all(b"NOT_FOUND\r\n")?;
                    }
                    Err(e) => write!(writer, "CLIENT_ERROR {e}\r\n")?,
                }
            }
            "stats" => {
                let blocks = WORKER_STATS.get().map(Vec::as_slice).unwrap_or(&[]);
                let refs: Vec<&shardcache::StatsBlock> =
                    blocks.iter().map(|b| &**b).collect();
                let snap = cache.stats_snapshot(&refs);
                let json = serde_json::to_string(&snap)
                    .expect("stats snapshot is always serializable");
                write!(writer, "{json}\r\nEND\r\n")?;
            }
            "quit" => return Ok(()),
            _ => writer.write_all(b"ERROR\r\n")?,
        }
        writer.flush()?;
    }
}
