// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rmc-sub-test - conformance harness for the reliable multicast subscriber
//!
//! Joins a multicast group, receives `"<node_id>:<pid>:<max>"` payloads from
//! the expected publishers and verifies that each publisher delivers pids
//! `1..=max` strictly in order. Exits with status 255 on the first violation.

use clap::Parser;
use colored::*;
use rmc_sub::config::{DEFAULT_ACK_TIMEOUT, DEFAULT_MULTICAST_GROUP, DEFAULT_MULTICAST_PORT};
use rmc_sub::{
    Deadline, Error, EventLoop, NetTransport, Progress, SequenceVerifier, SubContext,
    SubscriberConfig,
};
use std::net::Ipv4Addr;
use std::process;
use std::time::{Duration, Instant};

/// Exit status for any protocol violation.
const EXIT_VIOLATION: i32 = 255;

/// Reliable multicast subscriber conformance test
#[derive(Parser, Debug)]
#[command(name = "rmc-sub-test")]
#[command(version = "0.1.0")]
#[command(about = "Verify ordered delivery from reliable multicast publishers")]
struct Args {
    /// Multicast group address
    #[arg(short = 'm', long, default_value_t = DEFAULT_MULTICAST_GROUP)]
    mcast_addr: Ipv4Addr,

    /// Interface address used to join the group
    #[arg(short = 'i', long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    mcast_if: Ipv4Addr,

    /// Multicast port
    #[arg(short = 'p', long, default_value_t = DEFAULT_MULTICAST_PORT)]
    port: u16,

    /// Node id of a publisher expected to send traffic (repeatable)
    #[arg(short = 'e', long = "expect", required = true)]
    expect: Vec<u32>,

    /// Size of the node id table
    #[arg(short = 'n', long, default_value = "16")]
    table_size: usize,

    /// Acknowledgement timeout in milliseconds
    #[arg(short = 't', long, default_value_t = DEFAULT_ACK_TIMEOUT.as_millis() as u64)]
    ack_timeout_ms: u64,

    /// Subscriber context id (0 = random)
    #[arg(short = 'c', long, default_value = "0")]
    context_id: u32,
}

fn main() {
    // Initialize logger for RUST_LOG-based debug output
    env_logger::init();

    let args = Args::parse();

    match run(&args) {
        Ok(()) => {}
        Err(e) if e.is_protocol() => {
            eprintln!("{}: {}", "Violation".red().bold(), e);
            process::exit(EXIT_VIOLATION);
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<(), Error> {
    let mut verifier = SequenceVerifier::new(args.table_size);
    for &node_id in &args.expect {
        verifier.expect(node_id)?;
    }

    let config = SubscriberConfig::builder()
        .multicast_group(args.mcast_addr)
        .multicast_iface(args.mcast_if)
        .multicast_port(args.port)
        .ack_timeout(Duration::from_millis(args.ack_timeout_ms))
        .context_id(args.context_id)
        .env_overrides()
        .build()?;

    let mut event_loop = EventLoop::new()?;
    let transport = NetTransport::new(&config)?;
    let mut ctx = SubContext::new(config, Box::new(event_loop.host()?), Box::new(transport))?;
    ctx.activate()?;

    println!(
        "{} context {} group {}:{} expecting {:?}",
        "rmc-sub-test".bold(),
        format!("{:#010x}", ctx.context_id()).cyan(),
        args.mcast_addr,
        args.port,
        args.expect
    );

    let started = Instant::now();
    let mut delivered: u64 = 0;

    while !verifier.all_done() {
        let deadline = ctx.next_deadline(Instant::now());
        log::trace!("[HARNESS] timeout {:?}", deadline.as_timeout());
        pump(&mut event_loop, &mut ctx, deadline)?;
        ctx.process_timeouts(Instant::now())?;

        let mut first_pid = None;
        let mut last_pid = None;
        while let Some(packet) = ctx.next_dispatch_ready() {
            let handle = packet.handle();
            let verdict = verifier.verify_payload(packet.payload);
            ctx.mark_dispatched(handle)?;

            first_pid.get_or_insert(handle.pid());
            last_pid = Some(handle.pid());
            delivered += 1;

            match verdict? {
                Progress::Accepted => {}
                Progress::PublisherCompleted | Progress::AllDone => println!(
                    "{} publisher {:#010x} complete at pid {}",
                    "✓".green(),
                    handle.publisher(),
                    handle.pid()
                ),
            }
        }
        if let (Some(first), Some(last)) = (first_pid, last_pid) {
            log::debug!("[HARNESS] dispatched pids [{}:{}]", first, last);
        }
    }

    println!("Shutting down");
    ctx.shutdown()?;
    loop {
        let deadline = ctx.next_deadline(Instant::now());
        if deadline.is_infinite() {
            break;
        }
        pump(&mut event_loop, &mut ctx, deadline)?;
        ctx.process_timeouts(Instant::now())?;
    }

    let stats = ctx.stats();
    println!(
        "{} {} packets in {:.2?} (received {}, duplicates {}, acks {}, loopbacks {})",
        "Done".green().bold(),
        delivered,
        started.elapsed(),
        stats.packets_received,
        stats.duplicates,
        stats.acks_sent,
        stats.loopbacks
    );
    Ok(())
}

/// Wait for readiness and feed every event to the context.
///
/// A timed-out wait is normal; a failed wait ends the session.
fn pump(event_loop: &mut EventLoop, ctx: &mut SubContext, deadline: Deadline) -> Result<(), Error> {
    let events = match event_loop.wait(deadline) {
        Ok(events) => events,
        Err(e) if e.is_control_flow() => return Ok(()),
        Err(e) => return Err(e),
    };
    for (index, mask) in events {
        ctx.handle_event(index, mask)?;
    }
    Ok(())
}
