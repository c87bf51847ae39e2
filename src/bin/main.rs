use clap::{Parser, Subcommand};
use log::info;
use std::net::IpAddr;
use std::time::Duration;
use tperf::{Client, Config, Mode, Protocol, Server, SessionEvent, TestResults};

#[derive(Parser)]
#[command(name = "tperf")]
#[command(about = "Network throughput testing over the iperf3 protocol", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as a responder
    Server {
        /// Port to listen on
        #[arg(short, long, default_value = "5201")]
        port: u16,

        /// Bind to specific address
        #[arg(short = 'B', long)]
        bind: Option<IpAddr>,

        /// Refuse tests whose total requested rate exceeds this many bits/sec
        #[arg(long)]
        max_bitrate: Option<u64>,

        /// Exit after serving this many tests
        #[arg(short = 'n', long)]
        max_tests: Option<usize>,

        /// Serve a single test and exit
        #[arg(short = '1', long)]
        one_off: bool,
    },

    /// Run as an initiator
    Client {
        /// Server address to connect to
        server: String,

        /// Port to connect to
        #[arg(short, long, default_value = "5201")]
        port: u16,

        /// Use UDP data streams
        #[arg(short, long)]
        udp: bool,

        /// Test duration in seconds
        #[arg(short = 't', long, default_value = "10")]
        time: u64,

        /// Transfer this many bytes instead of running for a duration
        #[arg(short = 'n', long)]
        bytes: Option<u64>,

        /// Transfer this many blocks instead of running for a duration
        #[arg(short = 'k', long)]
        blocks: Option<u64>,

        /// Target rate in bits/sec per stream (0 for unlimited)
        #[arg(short, long)]
        bandwidth: Option<u64>,

        /// Block size in bytes
        #[arg(short = 'l', long)]
        length: Option<usize>,

        /// Number of parallel streams
        #[arg(short = 'P', long, default_value = "1")]
        parallel: usize,

        /// Run in reverse mode (server sends, client receives)
        #[arg(short = 'R', long, conflicts_with = "bidir")]
        reverse: bool,

        /// Send and receive at the same time
        #[arg(long)]
        bidir: bool,

        /// Seconds of warm-up to leave out of the totals
        #[arg(short = 'O', long, default_value = "0")]
        omit: u64,

        /// Interval for periodic reports in seconds
        #[arg(short, long, default_value = "1")]
        interval: f64,

        /// Disable Nagle's algorithm
        #[arg(short = 'N', long)]
        no_delay: bool,

        /// TCP maximum segment size
        #[arg(short = 'M', long)]
        mss: Option<u32>,

        /// Socket buffer size in bytes
        #[arg(short = 'w', long)]
        window: Option<usize>,

        /// Bind data streams starting at this local port
        #[arg(long)]
        cport: Option<u16>,

        /// Print the final results as JSON
        #[arg(short = 'J', long)]
        json: bool,
    },
}

fn log_event(event: SessionEvent) {
    match event {
        SessionEvent::Connected { cookie, params } => {
            info!(
                "Connected, cookie {}, {:?} {:?}, {} stream(s)",
                cookie, params.protocol, params.mode, params.num_streams
            );
        }
        SessionEvent::NewStream { id, sender, local, peer } => {
            info!(
                "[{:>3}] {} {} <-> {}",
                id,
                if sender { "sending" } else { "receiving" },
                local.map_or_else(|| "-".to_string(), |a| a.to_string()),
                peer.map_or_else(|| "-".to_string(), |a| a.to_string())
            );
        }
        SessionEvent::Interval {
            omitted,
            streams,
            bytes,
            bits_per_second,
        } => {
            if let Some((_, first)) = streams.first() {
                info!(
                    "[SUM] {:6.2}-{:6.2} sec  {:>10} bytes  {:>8.2} Mbits/sec{}",
                    first.start.as_secs_f64(),
                    first.end.as_secs_f64(),
                    bytes,
                    bits_per_second / 1_000_000.0,
                    if omitted { "  (omitted)" } else { "" }
                );
            }
        }
        SessionEvent::Error(message) => log::error!("{}", message),
        _ => {}
    }
}

fn print_summary(results: &TestResults, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }

    info!(
        "{:?} {:?} over {:.2} sec: sent {} bytes ({:.2} Mbits/sec), received {} bytes ({:.2} Mbits/sec)",
        results.protocol,
        results.mode,
        results.duration.as_secs_f64(),
        results.bytes_sent,
        results.sent_bits_per_second() / 1_000_000.0,
        results.bytes_received,
        results.received_bits_per_second() / 1_000_000.0,
    );
    for stream in results.streams.iter().filter(|s| s.lost_packets > 0 || s.jitter_ms > 0.0) {
        info!(
            "[{:>3}] jitter {:.3} ms, lost {}/{} datagrams",
            stream.id, stream.jitter_ms, stream.lost_packets, stream.packets
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            port,
            bind,
            max_bitrate,
            max_tests,
            one_off,
        } => {
            let mut config = Config::server(port);
            config.bind_addr = bind;
            if let Some(limit) = max_bitrate {
                config = config.with_bitrate_limit(limit);
            }
            if let Some(max) = max_tests {
                config = config.with_max_tests(max);
            }
            if one_off {
                config = config.with_max_tests(1);
            }

            let server = Server::new(config)?.with_callback(log_event);
            let token = server.cancellation_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });
            server.run().await?;
        }

        Commands::Client {
            server,
            port,
            udp,
            time,
            bytes,
            blocks,
            bandwidth,
            length,
            parallel,
            reverse,
            bidir,
            omit,
            interval,
            no_delay,
            mss,
            window,
            cport,
            json,
        } => {
            let protocol = if udp { Protocol::Udp } else { Protocol::Tcp };
            let mode = if bidir {
                Mode::Bidirectional
            } else if reverse {
                Mode::Receive
            } else {
                Mode::Send
            };

            let mut config = Config::client(server, port)
                .with_protocol(protocol)
                .with_duration(Duration::from_secs(time))
                .with_parallel(parallel)
                .with_mode(mode)
                .with_omit(Duration::from_secs(omit))
                .with_interval(Duration::try_from_secs_f64(interval)?)
                .with_no_delay(no_delay);

            if let Some(n) = bytes {
                config = config.with_bytes(n);
            }
            if let Some(k) = blocks {
                config = config.with_blocks(k);
            }
            if let Some(bw) = bandwidth {
                config = config.with_bandwidth(bw);
            }
            if let Some(len) = length {
                config = config.with_block_size(len);
            }
            if let Some(mss) = mss {
                config = config.with_mss(mss);
            }
            if let Some(size) = window {
                config = config.with_socket_buffer_size(size);
            }
            if let Some(port) = cport {
                config = config.with_bind_port(port);
            }

            let client = Client::new(config)?.with_callback(log_event);
            let token = client.cancellation_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });
            let results = client.run().await?;
            print_summary(&results, json)?;
        }
    }

    Ok(())
}
