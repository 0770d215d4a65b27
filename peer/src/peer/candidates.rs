// SPDX-License-Identifier: MPL-2.0

use audiolink_signalling_protocol as p;
use tracing::{debug, warn};

use super::{NegotiationError, PeerConnectionManager};

/// Holds back remote candidates that arrive before the remote description.
///
/// Trickled candidates can overtake the offer or answer they belong to. The
/// buffer applies candidates straight away once the manager has a remote
/// description, and otherwise keeps them until
/// [`IceCandidateBuffer::set_remote_description`] flushes them in arrival
/// order.
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    pending: Vec<p::IceCandidate>,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(
        &mut self,
        manager: &PeerConnectionManager,
        candidate: p::IceCandidate,
    ) -> Result<(), NegotiationError> {
        if manager.has_remote_description() {
            manager.add_ice_candidate(candidate).await
        } else {
            debug!(
                pending = self.pending.len() + 1,
                "No remote description yet, holding candidate"
            );
            self.pending.push(candidate);
            Ok(())
        }
    }

    /// Applies `description` and then every held candidate.
    ///
    /// All held candidates are tried, the first failure is returned.
    pub async fn set_remote_description(
        &mut self,
        manager: &PeerConnectionManager,
        description: p::SessionDescription,
    ) -> Result<(), NegotiationError> {
        manager.set_remote_description(description).await?;

        self.flush(manager).await
    }

    async fn flush(&mut self, manager: &PeerConnectionManager) -> Result<(), NegotiationError> {
        let mut res = Ok(());

        for candidate in std::mem::take(&mut self.pending) {
            if let Err(err) = manager.add_ice_candidate(candidate).await {
                warn!("Failed to apply held candidate: {}", err);
                if res.is_ok() {
                    res = Err(err);
                }
            }
        }

        res
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops held candidates, e.g. when starting a new negotiation
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerSettings;
    use crate::transport::loopback::LoopbackNetwork;
    use std::sync::Arc;

    fn candidate(n: u32) -> p::IceCandidate {
        p::IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    #[test_log::test(tokio::test)]
    async fn flushes_in_arrival_order() {
        let (a, b) = LoopbackNetwork::pair();
        let offerer = PeerConnectionManager::new(PeerSettings::default(), Arc::new(a));
        let answerer = PeerConnectionManager::new(PeerSettings::default(), Arc::new(b.clone()));
        offerer.initialize().await.unwrap();
        answerer.initialize().await.unwrap();

        let mut buffer = IceCandidateBuffer::new();
        buffer.add(&answerer, candidate(1)).await.unwrap();
        buffer.add(&answerer, candidate(2)).await.unwrap();
        assert_eq!(buffer.len(), 2);
        assert!(b.remote_candidates().is_empty());

        let offer = offerer.create_offer().await.unwrap();
        buffer
            .set_remote_description(&answerer, offer)
            .await
            .unwrap();
        assert!(buffer.is_empty());

        // Applied directly from now on
        buffer.add(&answerer, candidate(3)).await.unwrap();
        assert!(buffer.is_empty());

        assert_eq!(
            b.remote_candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );
    }

    #[test_log::test(tokio::test)]
    async fn flush_reports_first_failure() {
        let (a, b) = LoopbackNetwork::pair();
        let offerer = PeerConnectionManager::new(PeerSettings::default(), Arc::new(a));
        let answerer = PeerConnectionManager::new(PeerSettings::default(), Arc::new(b.clone()));
        offerer.initialize().await.unwrap();
        answerer.initialize().await.unwrap();

        let mut buffer = IceCandidateBuffer::new();
        buffer
            .add(
                &answerer,
                p::IceCandidate {
                    candidate: "bogus".into(),
                    sdp_mid: None,
                    sdp_m_line_index: None,
                },
            )
            .await
            .unwrap();
        buffer.add(&answerer, candidate(1)).await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        let res = buffer.set_remote_description(&answerer, offer).await;

        assert!(matches!(res, Err(NegotiationError::Transport(_))));
        assert_eq!(b.remote_candidates(), vec![candidate(1)]);
        assert!(buffer.is_empty());
    }
}
