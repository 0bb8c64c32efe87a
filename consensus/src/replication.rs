use std::time::Duration;

use tokio::time::{interval, sleep, Instant};

use network::{
    Channel, Connection, LogAction, LogEntry, LogId, Message, NodeInfo, Opcode, Payload,
};

use crate::raft::RaftNode;
use crate::{ConsensusError, Result};

impl RaftNode {
    /// Leader only: creates a log entry, replicates it to every live peer and
    /// only then applies it locally.
    pub(crate) async fn propose(&self, action: LogAction) -> Result<LogId> {
        let _proposal = self.proposals.lock().await;

        let entry = {
            let mut state = self.state.write().await;
            if !state.is_leader() {
                return Err(ConsensusError::NotLeader(state.leader_id()));
            }
            state.in_replication = true;
            let after = state.last_log_id.max(self.log.newest_id().await);
            LogEntry {
                id: LogId::next(after, self.identity.origin),
                action,
            }
        };

        self.log.push(entry.clone()).await;
        self.propagate(&entry).await;
        self.apply_entry(&entry).await;

        self.state.write().await.in_replication = false;
        self.save_signal.notify_one();
        tracing::debug!("Committed log entry {}", entry.id);
        Ok(entry.id)
    }

    async fn propagate(&self, entry: &LogEntry) {
        let message = Message::new(
            entry.opcode(),
            Payload::Entry(entry.clone()),
            self.local_info().await,
        );

        for (peer, reply) in self.network.broadcast(Channel::Replication, &message).await {
            match reply {
                Ok(reply) => match reply.error() {
                    Some(e) => tracing::warn!("{} refused entry {}: {}", peer.label(), entry.id, e),
                    None => self.network.peers().touch(reply.info).await,
                },
                Err(e) => self.mark_dead(&peer, &e).await,
            }
        }
    }

    /// Applies `entry` to the K-V table if it is newer than our watermark.
    pub(crate) async fn apply_entry(&self, entry: &LogEntry) -> bool {
        let mut state = self.state.write().await;
        if entry.id <= state.last_log_id {
            return false;
        }

        match &entry.action {
            LogAction::Set(items) => self.kv.set_many(items.clone()).await,
            LogAction::Remove(keys) => {
                self.kv.remove_many(keys).await;
            }
        }
        state.last_log_id = entry.id;
        state.log_count += 1;
        true
    }

    /// REPL_SET / REPL_REMOVE carrying an entry from the leader.
    pub(crate) async fn handle_entry(&self, message: Message) -> Message {
        {
            let state = self.state.read().await;
            if state.is_leader() {
                drop(state);
                return self.error_reply("not a follower").await;
            }
            if state.leader_id().as_deref() != Some(message.info.id.as_str()) {
                drop(state);
                tracing::debug!("Refusing entry from {}, not our leader", message.info.label());
                return self.error_reply("entry not sent by our leader").await;
            }
        }
        let Payload::Entry(entry) = message.body else {
            return self.error_reply("expected a log entry").await;
        };

        if self.apply_entry(&entry).await {
            self.log.push(entry).await;
            self.save_signal.notify_one();
        }
        Message::empty(Opcode::Response, self.local_info().await)
    }

    /// REPL_SET / REPL_REMOVE forwarded by a follower on behalf of a client.
    pub(crate) async fn handle_client_mutation(&self, message: Message) -> Message {
        let action = match message.body {
            Payload::Items(items) => LogAction::Set(items),
            Payload::Keys(keys) => LogAction::Remove(keys),
            _ => return self.error_reply("expected items or keys").await,
        };

        match self.propose(action).await {
            Ok(_) => Message::empty(Opcode::Response, self.local_info().await),
            Err(e) => self.error_reply(&e.to_string()).await,
        }
    }

    pub(crate) async fn error_reply(&self, error: &str) -> Message {
        Message::new(
            Opcode::Response,
            Payload::Error(error.to_string()),
            self.local_info().await,
        )
    }

    /// Leader only: keeps one replication task running per live peer.
    pub(crate) async fn replication_loop(&self) -> Result<()> {
        let mut ticker = interval(self.config.repl_heartbeat_interval());

        loop {
            ticker.tick().await;
            if !self.is_running() {
                return Ok(());
            }

            let epoch = {
                let state = self.state.read().await;
                if !state.is_leader() {
                    continue;
                }
                state.epoch
            };

            for peer in self.network.peers().alive().await {
                if self.replicators.claim(&peer.id, epoch).await {
                    let node = self.clone_for_task();
                    tokio::spawn(async move {
                        node.replicate_peer(peer.id.clone(), epoch).await;
                        node.replicators.release(&peer.id, epoch).await;
                    });
                }
            }
        }
    }

    async fn replicate_peer(&self, peer_id: String, epoch: u64) {
        let peers_interval = Duration::from_millis(self.config.peers_sync_interval_ms);
        let mut last_peers_sync: Option<Instant> = None;

        loop {
            if !self.is_running() || !self.leads_in(epoch).await {
                break;
            }
            let Some(peer) = self.network.peers().get(&peer_id).await else {
                break;
            };
            if !peer.is_alive() {
                break;
            }

            if let Err(e) = self.sync_with(&peer).await {
                self.mark_dead(&peer, &e).await;
                break;
            }

            if last_peers_sync.map_or(true, |at| at.elapsed() >= peers_interval) {
                if let Err(e) = self.send_peers(&peer).await {
                    tracing::debug!("Peer list sync to {} failed: {}", peer.label(), e);
                }
                last_peers_sync = Some(Instant::now());
            }

            sleep(self.config.repl_heartbeat_interval()).await;
        }
    }

    /// One replication heartbeat exchange with a follower, followed by
    /// whatever resync it asks for.
    pub(crate) async fn sync_with(&self, peer: &NodeInfo) -> Result<()> {
        let me = {
            let state = self.state.read().await;
            if state.in_replication {
                return Ok(());
            }
            self.info_from(&state)
        };

        let mut conn = self.network.connect(peer, Channel::Replication).await?;
        let reply = conn.call(&Message::empty(Opcode::ReplHeartbeat, me)).await?;
        if let Some(e) = reply.error() {
            return Err(ConsensusError::Rejected(e.to_string()));
        }
        let remote = reply.info.clone();
        self.network.peers().touch(remote.clone()).await;

        match reply.head {
            Opcode::ReplNeedUpdateFollower => {
                tracing::debug!("{} is behind, pushing log", remote.label());
                self.push_log_updates(&mut conn, &remote).await
            }
            Opcode::ServiceNeedUpdateFollower => {
                tracing::debug!("{} has stale services, pushing table", remote.label());
                self.push_service_update(&mut conn).await
            }
            Opcode::ReplNeedUpdateLeader | Opcode::ServiceNeedUpdateLeader => {
                tracing::info!("{} is ahead of the leader, pulling its state", remote.label());
                // An in-flight proposal must commit before the watermark moves.
                let _proposal = self.proposals.lock().await;
                self.receive_updates(&mut conn).await
            }
            _ => Ok(()),
        }
    }

    /// Catches `remote` up: the missing entries when the retained log covers
    /// the gap, the whole table otherwise. Ends the exchange with RESPONSE.
    pub(crate) async fn push_log_updates(&self, conn: &mut Connection, remote: &NodeInfo) -> Result<()> {
        let (my_id, my_count) = {
            let state = self.state.read().await;
            (state.last_log_id, state.log_count)
        };

        let gap = match self.log.entries_after(remote.last_log_id).await {
            Some(entries)
                if entries.last().map(|e| e.id) == Some(my_id)
                    && remote.log_count + entries.len() as u64 == my_count =>
            {
                Some(entries)
            }
            _ => None,
        };

        let mut caught_up = false;
        if let Some(entries) = gap {
            tracing::debug!("Incremental update of {} entries to {}", entries.len(), remote.label());
            let update = Message::new(
                Opcode::ReplIncrementalUpdate,
                Payload::Entries(entries),
                self.local_info().await,
            );
            let ack = conn.call(&update).await?;
            caught_up = ack.info.last_log_id == my_id && ack.info.log_count == my_count;
        }

        if !caught_up {
            let update = {
                let state = self.state.read().await;
                let table = self.kv.snapshot().await;
                Message::new(Opcode::ReplCompleteUpdate, Payload::Table(table), self.info_from(&state))
            };
            tracing::debug!("Complete update to {}", remote.label());
            conn.call(&update).await?;
        }

        conn.send(&Message::empty(Opcode::Response, self.local_info().await))
            .await?;
        Ok(())
    }

    pub(crate) async fn push_service_update(&self, conn: &mut Connection) -> Result<()> {
        let update = {
            let state = self.state.read().await;
            let services = self.services.all().await;
            Message::new(Opcode::ServiceUpdate, Payload::Services(services), self.info_from(&state))
        };
        conn.call(&update).await?;
        conn.send(&Message::empty(Opcode::Response, self.local_info().await))
            .await?;
        Ok(())
    }

    /// Applies updates pushed by the other side until it sends RESPONSE.
    pub(crate) async fn receive_updates(&self, conn: &mut Connection) -> Result<()> {
        while let Some(message) = conn.recv().await? {
            match message.head {
                Opcode::Response => break,
                Opcode::ReplIncrementalUpdate | Opcode::ReplCompleteUpdate | Opcode::ServiceUpdate => {
                    self.apply_update(message).await?;
                    conn.send(&Message::empty(Opcode::Response, self.local_info().await))
                        .await?;
                }
                other => {
                    return Err(ConsensusError::InvalidMessage(format!(
                        "{:?} during resync",
                        other
                    )))
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn apply_update(&self, message: Message) -> Result<()> {
        let sender = message.info;

        match (message.head, message.body) {
            (Opcode::ReplIncrementalUpdate, Payload::Entries(entries)) => {
                self.state.write().await.in_replication = true;
                let mut applied = 0;
                for entry in entries {
                    if self.apply_entry(&entry).await {
                        self.log.push(entry).await;
                        applied += 1;
                    }
                }
                self.state.write().await.in_replication = false;
                tracing::debug!("Applied {} entries from {}", applied, sender.label());
            }
            (Opcode::ReplCompleteUpdate, Payload::Table(table)) => {
                let mut state = self.state.write().await;
                let keys = table.len();
                self.kv.replace(table).await;
                self.log.clear().await;
                state.last_log_id = state.last_log_id.max(sender.last_log_id);
                state.log_count = state.log_count.max(sender.log_count);
                tracing::info!(
                    "Replaced table with {} keys from {} (log id {})",
                    keys,
                    sender.label(),
                    state.last_log_id
                );
            }
            (Opcode::ServiceUpdate, Payload::Services(services)) => {
                let mut state = self.state.write().await;
                self.services.replace(services).await;
                state.last_service_log_id = state.last_service_log_id.max(sender.last_service_log_id);
            }
            (head, _) => {
                return Err(ConsensusError::InvalidMessage(format!(
                    "unexpected payload for {:?}",
                    head
                )))
            }
        }

        self.save_signal.notify_one();
        Ok(())
    }

    /// REPL_HEARTBEAT on a follower: compares watermarks with the leader and
    /// either acknowledges, asks for an update, or pushes ours.
    pub(crate) async fn handle_repl_heartbeat(&self, conn: &mut Connection, message: Message) -> Result<()> {
        let leader = message.info;

        let (reply, me) = {
            let state = self.state.read().await;
            let me = self.info_from(&state);
            let from_our_leader = state.leader_id().as_deref() == Some(leader.id.as_str());
            let head = if state.in_replication || !from_our_leader {
                Opcode::Response
            } else {
                let ours = (state.last_log_id, state.log_count);
                let theirs = (leader.last_log_id, leader.log_count);
                if ours < theirs {
                    Opcode::ReplNeedUpdateFollower
                } else if ours > theirs {
                    Opcode::ReplNeedUpdateLeader
                } else if state.last_service_log_id < leader.last_service_log_id {
                    Opcode::ServiceNeedUpdateFollower
                } else if state.last_service_log_id > leader.last_service_log_id {
                    Opcode::ServiceNeedUpdateLeader
                } else {
                    Opcode::Response
                }
            };
            (head, me)
        };

        conn.send(&Message::empty(reply, me)).await?;

        match reply {
            Opcode::ReplNeedUpdateLeader => self.push_log_updates(conn, &leader).await,
            Opcode::ServiceNeedUpdateLeader => self.push_service_update(conn).await,
            _ => Ok(()),
        }
    }

    async fn send_peers(&self, peer: &NodeInfo) -> Result<()> {
        let me = self.local_info().await;
        let mut peers = self.network.peers().all().await;
        peers.push(me.clone());

        let message = Message::new(Opcode::ReplPeersUpdate, Payload::Peers(peers), me);
        let reply = self.network.request(peer, Channel::Replication, &message).await?;
        self.network.peers().touch(reply.info).await;
        Ok(())
    }

    /// REPL_PEERS_UPDATE: learn members we have not met yet.
    pub(crate) async fn handle_peers_update(&self, message: Message) -> Message {
        if let Payload::Peers(peers) = message.body {
            let added = self.network.peers().merge_missing(peers, &self.identity.id).await;
            if added > 0 {
                tracing::info!("Learned {} new peers from {}", added, message.info.label());
            }
        }
        Message::empty(Opcode::Response, self.local_info().await)
    }

    /// Drops log entries every live peer has already applied.
    pub(crate) async fn log_trim_loop(&self) -> Result<()> {
        let mut ticker = interval(Duration::from_millis(self.config.log_clean_interval_ms));

        loop {
            ticker.tick().await;
            if !self.is_running() {
                return Ok(());
            }

            let own = self.state.read().await.last_log_id;
            let upto = match self.network.peers().min_alive_log_id().await {
                Some(min) => min.min(own),
                None => own,
            };
            let trimmed = self.log.trim_through(upto).await;
            if trimmed > 0 {
                tracing::debug!("Trimmed {} log entries through {}", trimmed, upto);
            }
        }
    }

    /// Leader only: pushes the service table to every live peer.
    pub(crate) async fn publish_services(&self) {
        let message = {
            let state = self.state.read().await;
            let services = self.services.all().await;
            Message::new(Opcode::ServiceUpdate, Payload::Services(services), self.info_from(&state))
        };

        for (peer, reply) in self.network.broadcast(Channel::Replication, &message).await {
            if let Err(e) = reply {
                self.mark_dead(&peer, &e).await;
            }
        }
    }
}
