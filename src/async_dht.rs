//! AsyncDht node.

use std::net::SocketAddr;

use crate::actor::{BroadcastEvent, FindPeerResult, GetValueResult, Info, TouchResult};
use crate::common::{ActiveResult, PeerInfo};
use crate::dht::{ActorMessage, Dht, DhtWasShutdown, ValueRequest};
use crate::ResultCode;

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Information and statistics about this node.
    pub async fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0
             .0
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    pub async fn online_peers(&self) -> Result<Vec<PeerInfo>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<PeerInfo>>(1);

        self.0
             .0
            .send(ActorMessage::OnlinePeers(None, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    pub async fn random_peers(&self, count: usize) -> Result<Vec<PeerInfo>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<PeerInfo>>(1);

        self.0
             .0
            .send(ActorMessage::RandomPeers(count, None, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Stop every running task and end the actor thread.
    pub async fn stop(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0 .0.send(ActorMessage::Stop(sender));
        let _ = receiver.recv_async().await;
    }

    pub async fn find_peer(&self, peerid: &str) -> Result<FindPeerResult, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<FindPeerResult>(1);

        self.0
             .0
            .send(ActorMessage::FindPeer(peerid.to_string(), None, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    pub async fn save_value(
        &self,
        table: &str,
        key: &str,
        value: &str,
    ) -> Result<TouchResult, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<TouchResult>(1);

        self.0
             .0
            .send(ActorMessage::SaveValue(
                ValueRequest::new(table, key, None),
                value.to_string(),
                sender,
            ))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    pub async fn get_value(&self, table: &str, key: &str) -> Result<GetValueResult, DhtWasShutdown> {
        self.get(table, key, false).await
    }

    pub async fn get_closest_values(
        &self,
        table: &str,
        key: &str,
    ) -> Result<GetValueResult, DhtWasShutdown> {
        self.get(table, key, true).await
    }

    pub async fn delete_value(&self, table: &str, key: &str) -> Result<ResultCode, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<ResultCode>(1);

        self.0
             .0
            .send(ActorMessage::DeleteValue(
                ValueRequest::new(table, key, None),
                sender,
            ))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    pub async fn emit_broadcast_event(&self, data: &[u8]) -> Result<TouchResult, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<TouchResult>(1);

        self.0
             .0
            .send(ActorMessage::EmitBroadcastEvent(data.to_vec(), None, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Stream of every broadcast event delivered to this node from now on.
    pub fn broadcast_events(
        &self,
    ) -> Result<flume::r#async::RecvStream<'static, BroadcastEvent>, DhtWasShutdown> {
        // Events keep coming for as long as the node runs, so unbounded.
        let (sender, receiver) = flume::unbounded::<BroadcastEvent>();

        self.0
             .0
            .send(ActorMessage::AttachBroadcastListener(sender))
            .map_err(|_| DhtWasShutdown)?;

        Ok(receiver.into_stream())
    }

    pub async fn active_peer(
        &self,
        info: PeerInfo,
        address: Option<SocketAddr>,
        is_sent: bool,
        is_received: bool,
    ) -> Result<ActiveResult, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<ActiveResult>(1);

        self.0
             .0
            .send(ActorMessage::ActivePeer(
                info,
                address,
                is_sent,
                is_received,
                sender,
            ))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    pub async fn ping(&self, info: PeerInfo) -> Result<ResultCode, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<ResultCode>(1);

        self.0
             .0
            .send(ActorMessage::Ping(info, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Private Methods ===

    async fn get(&self, table: &str, key: &str, fuzzy: bool) -> Result<GetValueResult, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<GetValueResult>(1);

        self.0
             .0
            .send(ActorMessage::GetValue(
                ValueRequest::new(table, key, None),
                fuzzy,
                sender,
            ))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }
}
