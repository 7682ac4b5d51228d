//! Leader lookup within a committed consensus configuration.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::error::{BootstrapError, Result};
use crate::pb;

/// Returns the peer of the committed config whose permanent uuid matches the
/// leader uuid of `cstate`.
pub fn extract_leader_from_config(cstate: &pb::ConsensusState) -> Result<&pb::RaftPeer> {
    if cstate.leader_uuid.is_empty() {
        return Err(BootstrapError::NotFound(
            "No leader found in config".to_string(),
        ));
    }
    cstate
        .config
        .iter()
        .flat_map(|config| config.peers.iter())
        .find(|peer| peer.permanent_uuid == cstate.leader_uuid)
        .ok_or_else(|| BootstrapError::NotFound("No leader found in config".to_string()))
}

/// Resolves the leader's advertised host and port to one socket address.
///
/// Name lookup is a blocking libc call, so it runs on a blocking task and is
/// bounded by `deadline`; a slow or dead resolver cannot wedge the run.
pub async fn resolve_leader_addr(
    leader: &pb::RaftPeer,
    deadline: Duration,
) -> Result<SocketAddr> {
    let host_port = leader.last_known_addr.as_ref().ok_or_else(|| {
        BootstrapError::InvalidArgument(format!(
            "Unknown address for config leader {}",
            leader.permanent_uuid
        ))
    })?;
    let host = host_port.host.clone();
    let port = host_port.port as u16;
    let lookup = tokio::task::spawn_blocking(move || {
        (host.as_str(), port)
            .to_socket_addrs()
            .map(|mut addrs| addrs.next())
    });
    match tokio::time::timeout(deadline, lookup).await {
        Ok(Ok(Ok(Some(addr)))) => Ok(addr),
        Ok(Ok(Ok(None))) => Err(BootstrapError::NotFound(format!(
            "no address found for {}:{}",
            host_port.host, host_port.port
        ))),
        Ok(Ok(Err(e))) => Err(BootstrapError::io(
            format!("unable to resolve {}:{}", host_port.host, host_port.port),
            e,
        )),
        Ok(Err(e)) => Err(BootstrapError::IllegalState(format!(
            "address resolution task for {}:{} failed: {}",
            host_port.host, host_port.port, e
        ))),
        Err(_) => Err(BootstrapError::TimedOut(format!(
            "resolving {}:{} timed out after {} ms",
            host_port.host,
            host_port.port,
            deadline.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(uuid: &str, addr: Option<(&str, u32)>) -> pb::RaftPeer {
        pb::RaftPeer {
            permanent_uuid: uuid.to_string(),
            last_known_addr: addr.map(|(host, port)| pb::HostPort {
                host: host.to_string(),
                port,
            }),
        }
    }

    fn cstate(leader_uuid: &str, peers: Vec<pb::RaftPeer>) -> pb::ConsensusState {
        pb::ConsensusState {
            current_term: 1,
            leader_uuid: leader_uuid.to_string(),
            config: Some(pb::RaftConfig {
                peers,
                opid_index: 0,
            }),
        }
    }

    #[test]
    fn finds_the_leader_peer() {
        let state = cstate(
            "B",
            vec![peer("A", None), peer("B", Some(("127.0.0.1", 7051)))],
        );
        let leader = extract_leader_from_config(&state).unwrap();
        assert_eq!(leader.permanent_uuid, "B");
    }

    #[test]
    fn empty_leader_uuid_is_not_found() {
        let state = cstate("", vec![peer("A", None)]);
        let err = extract_leader_from_config(&state).unwrap_err();
        assert!(matches!(err, BootstrapError::NotFound(_)));
        assert!(err.to_string().contains("No leader found in config"));
    }

    #[test]
    fn unmatched_leader_uuid_is_not_found() {
        let state = cstate("X", vec![peer("A", None), peer("B", None)]);
        let err = extract_leader_from_config(&state).unwrap_err();
        assert!(matches!(err, BootstrapError::NotFound(_)));
    }

    #[test]
    fn missing_config_is_not_found() {
        let state = pb::ConsensusState {
            current_term: 1,
            leader_uuid: "A".to_string(),
            config: None,
        };
        assert!(extract_leader_from_config(&state).is_err());
    }

    #[tokio::test]
    async fn resolves_a_numeric_address() {
        let leader = peer("B", Some(("127.0.0.1", 7051)));
        let addr = resolve_leader_addr(&leader, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:7051");
    }

    #[tokio::test]
    async fn missing_address_is_invalid_argument() {
        let leader = peer("B", None);
        let err = resolve_leader_addr(&leader, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidArgument(_)));
        assert!(err.to_string().contains("Unknown address for config leader"));
    }
}
