//! Collects [`ProcessProperties`] over DDMS.
//!
//! Each attempt opens a receiver whose activation sends `HELO` and `FEAT`,
//! then watches replies and VM events until everything is known or the
//! attempt times out. Attempts repeat while the name, `HELO` or `FEAT` is
//! still missing.
//!
//! [`ProcessProperties`]: crate::ProcessProperties

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::time::Duration;

use jdwpmux_frame::ddms::{self, ApnmEvent, FailReply, HeloReply, WaitEvent};
use jdwpmux_frame::{Chunk, ChunkType, Packet};
use jdwpmux_session::protocol::{feat_packet, helo_packet};
use jdwpmux_session::{SessionError, SharedJdwpSession};
use tracing::{debug, info, trace};

use crate::error::{ProcessError, Result};
use crate::handle::ProcessHandle;
use crate::properties::ProcessProperties;

/// Timing of property collection.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Wait before the first attempt, so another tool can connect first.
    pub start_delay: Duration,
    /// Bound on one attempt.
    pub properties_timeout: Duration,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_millis(500),
            properties_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Collect until done or until the handle's scope ends.
pub(crate) async fn run(handle: ProcessHandle, config: CollectorConfig) {
    let scope = handle.scope().clone();
    tokio::select! {
        _ = scope.cancelled() => debug!(pid = handle.pid(), "property collection cancelled"),
        _ = collect(&handle, &config) => {}
    }
}

async fn collect(handle: &ProcessHandle, config: &CollectorConfig) {
    tokio::time::sleep(config.start_delay).await;
    let mut replayed = Replayed::default();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let mut state = CollectState::default();
        let outcome = tokio::time::timeout(
            config.properties_timeout,
            collect_once(handle, &mut state, &mut replayed),
        )
        .await;

        let exception = match outcome {
            // Common when the VM never sends WAIT, or another debugger holds the process.
            Err(_) => {
                debug!(pid = handle.pid(), attempt, "property collection attempt timed out");
                None
            }
            Ok(Ok(())) => None,
            Ok(Err(err)) if err.is_cancelled() => {
                debug!(pid = handle.pid(), "property collection cancelled");
                return;
            }
            Ok(Err(err)) if err.is_end_of_stream() => {
                debug!(pid = handle.pid(), attempt, "session ended during property collection");
                None
            }
            Ok(Err(err)) => {
                info!(pid = handle.pid(), attempt, error = %err, "property collection failed");
                Some(err.to_string())
            }
        };

        if !state.is_done(&handle.properties()) {
            debug!(
                pid = handle.pid(),
                attempt,
                summary = %handle.properties().summary(),
                "properties incomplete, retrying"
            );
            tokio::time::sleep(config.retry_delay).await;
            continue;
        }

        handle.update_properties(|props| {
            props.completed = true;
            props.exception = exception;
        });
        debug!(pid = handle.pid(), summary = %handle.properties().summary(), "process properties collected");
        return;
    }
}

#[derive(Default)]
struct CollectState {
    helo_id: u32,
    feat_id: u32,
    helo_received: bool,
    feat_received: bool,
    wait_received: bool,
}

impl CollectState {
    fn is_done(&self, props: &ProcessProperties) -> bool {
        self.helo_received && self.feat_received && props.process_name.is_some()
    }

    /// No negative form of WAIT exists, so only a WAIT ends the attempt early.
    fn has_collected_everything(&self, props: &ProcessProperties) -> bool {
        self.is_done(props) && self.wait_received
    }
}

/// VM-originated DDMS commands already added to a session's replay buffer.
#[derive(Default)]
struct Replayed {
    session: Option<SharedJdwpSession>,
    ids: HashSet<u32>,
}

impl Replayed {
    fn record(&mut self, shared: &SharedJdwpSession, packet: &Packet) -> Result<()> {
        if !self.session.as_ref().is_some_and(|s| s.ptr_eq(shared)) {
            self.session = Some(shared.clone());
            self.ids.clear();
        }
        if self.ids.insert(packet.id) {
            shared.add_replay_packet(packet)?;
        }
        Ok(())
    }
}

async fn collect_once(
    handle: &ProcessHandle,
    state: &mut CollectState,
    replayed: &mut Replayed,
) -> Result<()> {
    let shared = handle.shared_session().await?;
    let helo = helo_packet(shared.next_packet_id()?);
    let feat = feat_packet(shared.next_packet_id()?);
    state.helo_id = helo.id;
    state.feat_id = feat.id;

    let sender = shared.clone();
    shared
        .new_packet_receiver()?
        .with_name("properties collector")
        .on_activation(move || async move {
            sender.send_packet(&helo).await?;
            sender.send_packet(&feat).await
        })
        .receive(|packet| {
            std::future::ready(process_packet(handle, &shared, state, replayed, &packet))
        })
        .await?;
    Ok(())
}

fn process_packet(
    handle: &ProcessHandle,
    shared: &SharedJdwpSession,
    state: &mut CollectState,
    replayed: &mut Replayed,
    packet: &Packet,
) -> Result<ControlFlow<()>> {
    trace!(pid = handle.pid(), %packet, "collector packet");
    if packet.is_reply() && packet.id == state.helo_id {
        let helo = HeloReply::parse(&reply_chunk(packet, ChunkType::Helo)?)
            .map_err(|err| invalid("HELO", err))?;
        debug!(pid = handle.pid(), ?helo, "HELO reply");
        handle.update_properties(|props| props.apply_helo(&helo));
        state.helo_received = true;
    } else if packet.is_reply() && packet.id == state.feat_id {
        let features = ddms::parse_features(&reply_chunk(packet, ChunkType::Feat)?)
            .map_err(|err| invalid("FEAT", err))?;
        debug!(pid = handle.pid(), ?features, "FEAT reply");
        handle.update_properties(|props| props.features = features);
        state.feat_received = true;
    } else if packet.is_ddms_command() {
        replayed.record(shared, packet)?;
        let chunks = packet.ddms_chunks().map_err(|err| invalid("DDMS", err))?;
        for chunk in chunks {
            match chunk.chunk_type {
                ChunkType::Wait => {
                    let wait = WaitEvent::parse(&chunk).map_err(|err| invalid("WAIT", err))?;
                    debug!(pid = handle.pid(), ?wait, "WAIT command");
                    handle.update_properties(|props| props.apply_wait(&wait));
                    state.wait_received = true;
                }
                ChunkType::Apnm => {
                    let apnm = ApnmEvent::parse(&chunk).map_err(|err| invalid("APNM", err))?;
                    debug!(pid = handle.pid(), ?apnm, "APNM command");
                    handle.update_properties(|props| props.apply_apnm(&apnm));
                }
                other => debug!(pid = handle.pid(), chunk = %other, "skipping unexpected chunk"),
            }
        }
    }

    if state.has_collected_everything(&handle.properties()) {
        Ok(ControlFlow::Break(()))
    } else {
        Ok(ControlFlow::Continue(()))
    }
}

fn invalid(name: &str, err: impl std::fmt::Display) -> ProcessError {
    SessionError::DdmsProtocol(format!("invalid '{name}' packet: {err}")).into()
}

fn reply_chunk(packet: &Packet, expected: ChunkType) -> Result<Chunk> {
    if packet.error_code() != 0 {
        return Err(SessionError::CommandFailed {
            id: packet.id,
            error_code: packet.error_code(),
        }
        .into());
    }
    if packet.payload_len() == 0 {
        return Err(invalid(&expected.to_string(), "packet is empty"));
    }
    let payload = packet.payload().map_err(SessionError::from)?;
    let chunk = jdwpmux_frame::decode_chunks(&payload)
        .map_err(|err| invalid(&expected.to_string(), err))?
        .into_iter()
        .next()
        .ok_or_else(|| invalid(&expected.to_string(), "no chunk"))?;
    if chunk.chunk_type == ChunkType::Fail {
        let fail = FailReply::parse(&chunk).map_err(|err| invalid("FAIL", err))?;
        return Err(SessionError::DdmsFailed {
            code: fail.error_code,
            message: fail.message,
        }
        .into());
    }
    if chunk.chunk_type != expected {
        return Err(invalid(&expected.to_string(), format!("unexpected {} chunk", chunk.chunk_type)));
    }
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, FakeConnector};
    use jdwpmux_session::testing::FakeVmConfig;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(5);

    async fn completed(handle: &ProcessHandle) -> ProcessProperties {
        let mut properties = handle.subscribe_properties();
        let props = tokio::time::timeout(WAIT, properties.wait_for(|props| props.completed))
            .await
            .unwrap()
            .unwrap()
            .clone();
        props
    }

    #[tokio::test]
    async fn test_collects_helo_feat_and_wait() {
        let connector = Arc::new(FakeConnector::new().with_vm(FakeVmConfig {
            pid: 10,
            wait_after_helo: true,
            features: vec!["hprof-heap-dump".into(), "method-sample-profiling".into()],
            ..FakeVmConfig::default()
        }));
        let (registry, _feed) = test_support::registry(connector, [10]);
        let handle = registry.add_processes([10]).unwrap().remove(&10).unwrap();

        let props = completed(&handle).await;
        assert_eq!(props.pid, 10);
        assert_eq!(props.process_name.as_deref(), Some("com.example.app"));
        assert_eq!(props.package_name.as_deref(), Some("com.example.app"));
        assert_eq!(props.vm_identifier.as_deref(), Some("FakeVM 1.0"));
        assert_eq!(props.features.len(), 2);
        assert!(props.wait_command_received);
        assert!(props.is_waiting_for_debugger);
        assert_eq!(props.exception, None);

        // The WAIT event is replayed to later receivers.
        let shared = handle.shared_session().await.unwrap();
        assert_eq!(shared.replay_packet_count(), 1);
    }

    #[tokio::test]
    async fn test_early_name_is_replaced_by_apnm() {
        let connector = Arc::new(FakeConnector::new().with_vm(FakeVmConfig {
            pid: 11,
            process_name: "<pre-initialized>".into(),
            apnm_after_helo: Some("com.example.late".into()),
            wait_after_helo: true,
            ..FakeVmConfig::default()
        }));
        let (registry, _feed) = test_support::registry(connector, [11]);
        let handle = registry.add_processes([11]).unwrap().remove(&11).unwrap();

        let props = completed(&handle).await;
        assert_eq!(props.process_name.as_deref(), Some("com.example.late"));
    }

    #[tokio::test]
    async fn test_completes_on_timeout_without_wait() {
        let connector = Arc::new(FakeConnector::new().with_vm(FakeVmConfig {
            pid: 12,
            ..FakeVmConfig::default()
        }));
        let (registry, _feed) = test_support::registry(connector, [12]);
        let handle = registry.add_processes([12]).unwrap().remove(&12).unwrap();

        let props = completed(&handle).await;
        assert_eq!(props.process_name.as_deref(), Some("com.example.app"));
        assert!(!props.wait_command_received);
        assert_eq!(props.exception, None);
    }

    #[tokio::test]
    async fn test_keeps_retrying_while_helo_fails() {
        let connector = Arc::new(FakeConnector::new().with_vm(FakeVmConfig {
            pid: 13,
            fail_chunks: vec![ChunkType::Helo],
            ..FakeVmConfig::default()
        }));
        let (registry, _feed) = test_support::registry(connector, [13]);
        let handle = registry.add_processes([13]).unwrap().remove(&13).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let props = handle.properties();
        assert!(!props.completed);
        assert_eq!(props.process_name, None);

        handle.close();
    }

    #[test]
    fn test_reply_chunk_rejects_failures() {
        let fail = FailReply {
            error_code: 3,
            message: "nope".into(),
        }
        .to_chunk()
        .into_reply(1);
        let err = reply_chunk(&fail, ChunkType::Helo).unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Session(SessionError::DdmsFailed { code: 3, .. })
        ));

        let empty = Packet::reply(2, Vec::<u8>::new());
        assert!(reply_chunk(&empty, ChunkType::Feat).is_err());

        let wrong = ddms::helo_request().into_reply(3);
        assert!(reply_chunk(&wrong, ChunkType::Feat).is_err());
    }
}
