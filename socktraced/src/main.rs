use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};

use socktraced::config::Config;
use socktraced::{
    register_event_handle, running_socket_tracer_with, sockopt, socket_tracer,
    socket_tracer_stats, L7EventHandle, SocketRecord, TracerOptions, EVENT_TYPE_PROC_EXEC,
    EVENT_TYPE_PROC_EXIT,
};

#[derive(Parser, Debug)]
#[command(name = "socktraced")]
#[command(about = "eBPF socket tracer daemon")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH", default_value = "/etc/socktrace/socktrace.toml")]
    config: PathBuf,
    /// Number of worker threads (overrides the config file)
    #[arg(long)]
    workers: Option<usize>,
    /// Print captured payloads as well as record summaries
    #[arg(long)]
    dump_payload: bool,
    /// Print the introspection document every stats period
    #[arg(long)]
    show: bool,
}

fn print_record(record: &SocketRecord, dump_payload: bool) {
    let tuple = record.tuple();
    println!(
        "[data] uid={} seq={} {:?}/{:?} l7={:?} trace={} {}:{} -> {}:{} len={} comm={}",
        record.uid(),
        record.cap_seq(),
        record.direction(),
        record.msg_type(),
        record.l7_protocol_hint(),
        record.syscall_trace_id_call(),
        tuple.saddr,
        tuple.sport,
        tuple.daddr,
        tuple.dport,
        record.syscall_len(),
        record.process_name(),
    );
    if dump_payload {
        println!("       {:?}", String::from_utf8_lossy(record.cap_data()));
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.config != PathBuf::from("/etc/socktrace/socktrace.toml") {
        std::env::set_var("SOCKTRACE_CONFIG", &args.config);
    }
    let config = Config::load();
    let mut opts = TracerOptions::from(&config.tracer);
    if let Some(workers) = args.workers {
        opts.worker_threads = workers;
    }

    info!("starting socket tracer daemon");

    let dump_payload = args.dump_payload;
    let handle: L7EventHandle = Arc::new(move |record| print_record(record, dump_payload));
    running_socket_tracer_with(handle, opts)?;

    register_event_handle(
        EVENT_TYPE_PROC_EXEC,
        Arc::new(|event| {
            let comm = String::from_utf8_lossy(&event.comm);
            println!(
                "[proc] exec pid={} comm={}",
                event.pid,
                comm.trim_end_matches('\0')
            );
        }),
    )?;
    register_event_handle(
        EVENT_TYPE_PROC_EXIT,
        Arc::new(|event| {
            println!("[proc] exit pid={}", event.pid);
        }),
    )?;

    // Log a stats line every 10 seconds for whoever is watching journald.
    let show = args.show;
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(10));
        match socket_tracer_stats() {
            Ok(stats) => {
                info!(
                    "stats: state={} adapt={} kern_lost={} sockets={}/{} reclaims={}",
                    stats.state,
                    stats.is_adapt_success,
                    stats.kern_lost,
                    stats.socket_map_used,
                    stats.socket_map_max,
                    stats.socket_reclaims,
                );
                if show {
                    if let Ok(tracer) = socket_tracer() {
                        let doc = sockopt::get(&tracer, sockopt::Sockopt::SocktraceShow);
                        println!("{doc}");
                    }
                }
            }
            Err(e) => warn!("stats unavailable: {e}"),
        }
    });

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    let _ = rx.recv();

    info!("shutting down");
    if let Ok(tracer) = socket_tracer() {
        tracer.shutdown();
    }
    Ok(())
}
