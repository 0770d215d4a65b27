// SPDX-License-Identifier: MPL-2.0

use audiolink_signalling_protocol::AudioMetrics;

use crate::transport::{CandidatePairState, MediaKind, StatsReport};

/// Reduces a raw statistics report to one [`AudioMetrics`] sample.
///
/// Loss and jitter come from the inbound audio RTP report, the round trip
/// time from the succeeded candidate pair, preferring a nominated one. Times
/// are converted from seconds to milliseconds, missing values read as 0.
pub(crate) fn audio_metrics(reports: &[StatsReport]) -> AudioMetrics {
    let mut metrics = AudioMetrics::default();
    let mut rtt_from_nominated = false;

    for report in reports {
        match report {
            StatsReport::InboundRtp {
                kind: MediaKind::Audio,
                packets_lost,
                jitter,
                audio_level,
            } => {
                metrics.packets_lost = (*packets_lost).max(0) as u64;
                metrics.jitter = jitter * 1000.;
                if let Some(level) = audio_level {
                    metrics.output_level = level.clamp(0., 1.);
                }
            }
            StatsReport::MediaSource {
                kind: MediaKind::Audio,
                audio_level: Some(level),
            } => {
                metrics.input_level = level.clamp(0., 1.);
            }
            StatsReport::CandidatePair {
                state: CandidatePairState::Succeeded,
                nominated,
                current_round_trip_time: Some(rtt),
            } if !rtt_from_nominated => {
                metrics.round_trip_time = rtt * 1000.;
                rtt_from_nominated = *nominated;
            }
            _ => (),
        }
    }

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use audiolink_signalling_protocol::ConnectionQuality;

    fn inbound(packets_lost: i64, jitter: f64) -> StatsReport {
        StatsReport::InboundRtp {
            kind: MediaKind::Audio,
            packets_lost,
            jitter,
            audio_level: Some(0.25),
        }
    }

    fn pair(state: CandidatePairState, nominated: bool, rtt: f64) -> StatsReport {
        StatsReport::CandidatePair {
            state,
            nominated,
            current_round_trip_time: Some(rtt),
        }
    }

    #[test]
    fn converts_to_milliseconds() {
        let metrics = audio_metrics(&[
            StatsReport::MediaSource {
                kind: MediaKind::Audio,
                audio_level: Some(0.75),
            },
            inbound(3, 0.012),
            pair(CandidatePairState::Succeeded, true, 0.045),
        ]);

        assert_eq!(metrics.packets_lost, 3);
        assert!((metrics.jitter - 12.).abs() < 1e-9);
        assert!((metrics.round_trip_time - 45.).abs() < 1e-9);
        assert_eq!(metrics.input_level, 0.75);
        assert_eq!(metrics.output_level, 0.25);
        assert_eq!(metrics.quality(), ConnectionQuality::Fair);
    }

    #[test]
    fn no_succeeded_pair_means_zero_rtt() {
        let metrics = audio_metrics(&[
            inbound(0, 0.001),
            pair(CandidatePairState::InProgress, false, 0.3),
            pair(CandidatePairState::Failed, false, 0.5),
        ]);

        assert_eq!(metrics.round_trip_time, 0.);
        assert_eq!(metrics.quality(), ConnectionQuality::Excellent);
    }

    #[test]
    fn nominated_pair_wins() {
        let metrics = audio_metrics(&[
            pair(CandidatePairState::Succeeded, false, 0.3),
            pair(CandidatePairState::Succeeded, true, 0.02),
            pair(CandidatePairState::Succeeded, false, 0.4),
        ]);

        assert!((metrics.round_trip_time - 20.).abs() < 1e-9);
    }

    #[test]
    fn ignores_video_and_negative_loss() {
        let metrics = audio_metrics(&[
            StatsReport::InboundRtp {
                kind: MediaKind::Video,
                packets_lost: 40,
                jitter: 0.2,
                audio_level: None,
            },
            inbound(-2, 0.),
        ]);

        assert_eq!(metrics.packets_lost, 0);
        assert_eq!(metrics.jitter, 0.);
        assert_eq!(
            metrics,
            AudioMetrics {
                output_level: 0.25,
                ..Default::default()
            }
        );
    }
}
