//! TCP accept loop answering [`RaftRpc`] frames.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

use super::coordinator::Coordinator;
use super::network::{read_frame, write_frame, RaftReply, RaftRpc};

/// Accepts peers until `shutdown` flips or its sender is dropped.
pub(crate) async fn run(listener: TcpListener, coordinator: Arc<Coordinator>, mut shutdown: watch::Receiver<bool>) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "raft.server.listening");
    }
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let coordinator = coordinator.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(serve_peer(stream, peer, coordinator, shutdown).in_current_span());
                }
                Err(err) => warn!(error = %err, "raft.server.accept.error"),
            },
        }
    }
    info!("raft.server.stopped");
}

async fn serve_peer(
    mut stream: TcpStream,
    peer: SocketAddr,
    coordinator: Arc<Coordinator>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, error = %err, "raft.server.nodelay.error");
    }
    loop {
        let rpc = tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame::<_, RaftRpc>(&mut stream) => match frame {
                Ok(Some(rpc)) => rpc,
                Ok(None) => break,
                Err(err) => {
                    debug!(%peer, error = %err, "raft.server.read.error");
                    break;
                }
            },
        };
        let reply = dispatch(&coordinator, rpc).await;
        if let Err(err) = write_frame(&mut stream, &reply).await {
            debug!(%peer, error = %err, "raft.server.write.error");
            break;
        }
    }
}

async fn dispatch(coordinator: &Coordinator, rpc: RaftRpc) -> RaftReply {
    let raft = coordinator.raft();
    match rpc {
        RaftRpc::AppendEntries(req) => RaftReply::AppendEntries(raft.append_entries(req).await),
        RaftRpc::InstallSnapshot(req) => RaftReply::InstallSnapshot(raft.install_snapshot(req).await),
        RaftRpc::Vote(req) => RaftReply::Vote(raft.vote(req).await),
        RaftRpc::Join { node_id, addr } => {
            RaftReply::Membership(coordinator.membership_reply(coordinator.join(node_id, &addr).await))
        }
        RaftRpc::Leave { node_id } => {
            RaftReply::Membership(coordinator.membership_reply(coordinator.leave(node_id).await))
        }
    }
}
