use std::convert::Infallible;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use warp::{http::StatusCode, reply, Filter, Rejection, Reply};

use super::feed::LiveFeed;
use super::types::{ApiError, ControlAck, ControlCommand, PacketsQuery, StatusResponse};
use crate::analysis::runner::ModuleRunner;
use crate::data_capture::stats::StatsSnapshot;
use crate::data_capture::types::EngineState;
use crate::storage::rotator::RotatorStatus;

const DEFAULT_PACKET_LIMIT: usize = 100;

/// Read-only views of the pipeline plus the control channel.
#[derive(Clone)]
pub struct FeedState {
    pub interface: String,
    pub stats: watch::Receiver<StatsSnapshot>,
    pub engine: watch::Receiver<EngineState>,
    pub rotator: watch::Receiver<RotatorStatus>,
    pub runner: Option<Arc<ModuleRunner>>,
    pub feed: LiveFeed,
    pub control: mpsc::Sender<ControlCommand>,
}

fn with_state(state: FeedState) -> impl Filter<Extract = (FeedState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Every live-feed route.
pub fn routes(state: FeedState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    dashboard_route(state.clone())
        .or(stats_route(state.clone()))
        .or(packets_route(state.clone()))
        .or(status_route(state.clone()))
        .or(control_route(state))
}

/// GET /
pub fn dashboard_route(state: FeedState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path::end()
        .and(warp::get())
        .and(with_state(state))
        .map(|state: FeedState| {
            let stats = state.stats.borrow().clone();
            let html = format!(
                "<html><head><title>sniff</title></head><body>\
                 <h1>sniff on {}</h1><p>State: {}</p>\
                 <p>{} packets seen, {} written, {} dropped</p>\
                 <p>See /stats, /packets and /status for JSON.</p></body></html>",
                state.interface, stats.state, stats.packets_seen, stats.packets_written, stats.queue_drops
            );
            reply::html(html)
        })
}

/// GET /stats
pub fn stats_route(state: FeedState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("stats")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state))
        .map(|state: FeedState| {
            let snapshot = state.stats.borrow().clone();
            reply::json(&snapshot)
        })
}

/// GET /packets?limit=N
pub fn packets_route(state: FeedState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("packets")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<PacketsQuery>())
        .and(with_state(state))
        .map(|query: PacketsQuery, state: FeedState| {
            let limit = query
                .limit
                .unwrap_or(DEFAULT_PACKET_LIMIT)
                .min(state.feed.capacity());
            reply::json(&state.feed.recent(limit))
        })
}

/// GET /status
pub fn status_route(state: FeedState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("status")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state))
        .map(|state: FeedState| {
            let status = StatusResponse {
                interface: state.interface.clone(),
                engine: *state.engine.borrow(),
                rotator: state.rotator.borrow().clone(),
                analysis: state.runner.as_ref().map(|r| r.status()),
            };
            reply::json(&status)
        })
}

/// POST /control/{pause,resume,stop}
pub fn control_route(state: FeedState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("control" / String)
        .and(warp::post())
        .and(with_state(state))
        .and_then(|action: String, state: FeedState| async move {
            let command = match action.as_str() {
                "pause" => ControlCommand::Pause,
                "resume" => ControlCommand::Resume,
                "stop" => ControlCommand::Stop,
                _ => {
                    return Ok::<_, Rejection>(
                        reply::with_status(
                            reply::json(&ApiError {
                                message: format!("Unknown control action: {}", action),
                            }),
                            StatusCode::NOT_FOUND,
                        )
                        .into_response(),
                    )
                }
            };
            match state.control.send(command).await {
                Ok(()) => Ok(reply::with_status(
                    reply::json(&ControlAck { accepted: command }),
                    StatusCode::ACCEPTED,
                )
                .into_response()),
                Err(_) => Ok(reply::with_status(
                    reply::json(&ApiError {
                        message: "Pipeline is shutting down".to_string(),
                    }),
                    StatusCode::SERVICE_UNAVAILABLE,
                )
                .into_response()),
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::parser::tests::tcp_frame;
    use crate::decoder::types::RawFrame;
    use crate::decoder::{decode, PacketSummary};

    fn state() -> (FeedState, mpsc::Receiver<ControlCommand>) {
        let (_stats_tx, stats) = watch::channel(StatsSnapshot::idle("eth0"));
        let (_engine_tx, engine) = watch::channel(EngineState::Running);
        let (_rot_tx, rotator) = watch::channel(RotatorStatus::default());
        let (control, control_rx) = mpsc::channel(4);
        let feed = LiveFeed::new(50);
        for seq in 1..=20 {
            let bytes = tcp_frame(1000, 443, b"");
            let pkt = decode(seq, RawFrame::new(0, 0, bytes.len() as u32, bytes));
            feed.push(PacketSummary::from(&pkt));
        }
        let state = FeedState {
            interface: "eth0".into(),
            stats,
            engine,
            rotator,
            runner: None,
            feed,
            control,
        };
        (state, control_rx)
    }

    #[tokio::test]
    async fn packets_respects_limit() {
        let (state, _rx) = state();
        let res = warp::test::request()
            .method("GET")
            .path("/packets?limit=5")
            .reply(&routes(state))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: Vec<serde_json::Value> = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body.len(), 5);
        assert_eq!(body[4]["seq"], 20);
    }

    #[tokio::test]
    async fn stats_and_status_are_json() {
        let (state, _rx) = state();
        let filter = routes(state);
        let res = warp::test::request().path("/stats").reply(&filter).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["interface"], "eth0");

        let res = warp::test::request().path("/status").reply(&filter).await;
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["interface"], "eth0");
        assert!(body["analysis"].is_null());

        let res = warp::test::request().path("/").reply(&filter).await;
        assert!(String::from_utf8_lossy(res.body()).contains("sniff on eth0"));
    }

    #[tokio::test]
    async fn control_forwards_commands() {
        let (state, mut rx) = state();
        let filter = routes(state);
        let res = warp::test::request()
            .method("POST")
            .path("/control/pause")
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        assert_eq!(rx.recv().await, Some(ControlCommand::Pause));

        let res = warp::test::request()
            .method("POST")
            .path("/control/reboot")
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = warp::test::request()
            .method("GET")
            .path("/control/stop")
            .reply(&filter)
            .await;
        assert_ne!(res.status(), StatusCode::ACCEPTED);
        assert!(rx.try_recv().is_err());
    }
}
