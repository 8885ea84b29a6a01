use std::time::Instant;

use tracing::{debug, trace};

use crate::actor::config::Config;
use crate::actor::network::Network;
use crate::actor::sender::Target;
use crate::common::Endpoint;
use crate::protocol::{Body, Package, PieceBody};
use crate::ResultCode;

use super::{Progress, TaskState};

#[derive(Debug)]
/// Sends the fragments of one oversized package, each with its own resends,
/// until every fragment was acknowledged.
pub(crate) struct PieceSendTask {
    state: TaskState,
    target: Target,
    endpoint: Endpoint,
    pieces: Vec<PieceBody>,
    acked: Vec<bool>,
}

impl PieceSendTask {
    /// `taskid` is the id carried by every piece.
    pub fn new(
        taskid: u32,
        target: Target,
        endpoint: Endpoint,
        pieces: Vec<PieceBody>,
        config: &Config,
        now: Instant,
    ) -> Self {
        Self {
            state: TaskState::new(taskid, config, now),
            target,
            endpoint,
            acked: vec![false; pieces.len()],
            pieces,
        }
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn start(&mut self, net: &mut Network, now: Instant) -> Progress {
        for piece in &self.pieces {
            if let Err(error) =
                net.sender
                    .send_piece(&net.local, &self.target, self.endpoint, piece.clone(), now)
            {
                debug!(context = "piece", ?error, to = %self.target.peerid, "Failed to send piece");
                return Progress::Done(ResultCode::Failed);
            }
        }

        Progress::Running
    }

    pub fn on_response(&mut self, net: &mut Network, package: &Package, now: Instant) -> Progress {
        let Body::Piece(piece) = &package.body else {
            return Progress::Running;
        };

        let Some(acked) = self.acked.get_mut(piece.no as usize) else {
            return Progress::Running;
        };

        *acked = true;
        net.sender.ack(&self.target.peerid, package.header.ack_seq);
        self.state.touch(now);

        if self.acked.iter().all(|acked| *acked) {
            Progress::Done(ResultCode::Success)
        } else {
            Progress::Running
        }
    }

    /// Resends are driven per piece by the resend registry.
    pub fn on_idle(&mut self, _net: &mut Network, now: Instant) -> Progress {
        self.state.touch(now);
        Progress::Running
    }

    pub fn finish(self, code: ResultCode) {
        let missing = self.acked.iter().filter(|acked| !**acked).count();

        if code.is_success() {
            trace!(context = "piece", id = self.state.id, pieces = self.pieces.len(), "Pieces delivered");
        } else {
            debug!(
                context = "piece",
                id = self.state.id,
                ?code,
                missing,
                to = %self.target.peerid,
                "Fragmented package not delivered"
            );
        }
    }
}
