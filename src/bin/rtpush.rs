// Copyright (C) 2024 the rtpush developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Receives RTP/MPEG-PS flows over UDP and republishes each one as an
//! RTMP live stream named after its SSRC.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use rtpush::server::Server;
use rtpush::stage::{FlvMuxer, FuaReassembler, PsDepacketizer, RtmpPublisher, Stage};

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Args {
    /// UDP address to receive RTP flows on.
    #[arg(long, default_value = "0.0.0.0:5004")]
    bind: SocketAddr,

    /// RTMP endpoint to publish to, e.g. rtmp://localhost/live.
    #[arg(long)]
    push: String,

    /// Stream name prefix; each flow publishes as <name>_<ssrc>.
    #[arg(long, default_value = "stream")]
    name: String,

    /// Close flows idle for longer than this many seconds. 0 disables.
    #[arg(long, default_value_t = 30)]
    active_timeout: u64,

    /// Log verbosity (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: log::Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    simple_logger::init_with_level(args.log_level)?;

    let active_timeout =
        (args.active_timeout > 0).then(|| Duration::from_secs(args.active_timeout));
    let server = Server::new(args.bind, active_timeout);
    server.serve().await?;

    loop {
        let session = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            accepted = server.accept() => match accepted {
                Ok(session) => session,
                Err(e) => {
                    error!("accept failed: {e}");
                    break;
                }
            },
        };

        let push = args.push.clone();
        let name = format!("{}_{:08x}", args.name, session.ssrc());
        tokio::spawn(async move {
            info!(
                "flow ssrc={:08x} from {} publishing as {name}",
                session.ssrc(),
                session.addr()
            );
            let publisher = match RtmpPublisher::connect(&push, &name).await {
                Ok(publisher) => publisher,
                Err(e) => {
                    error!("rtmp connect for {name} failed: {e}");
                    session.close();
                    return;
                }
            };
            let mut muxer = FlvMuxer::new();
            muxer.attach(Box::new(publisher));
            let mut reassembler = FuaReassembler::new();
            reassembler.attach(Box::new(muxer));
            let mut depacketizer = PsDepacketizer::new();
            depacketizer.attach(Box::new(reassembler));
            session.attach(Box::new(depacketizer));

            match session.wait().await {
                Ok(()) => info!("flow ssrc={:08x} closed", session.ssrc()),
                Err(e) => error!("flow ssrc={:08x} failed: {e}", session.ssrc()),
            }
        });
    }

    info!("shutting down");
    server.close().await?;
    Ok(())
}
