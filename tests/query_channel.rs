//! Integration tests for [`QueryChannel`] driven against
//! [`FakeQueryTransport`].

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use axon_channel_connector::config::{ChannelConfig, SubscriptionQueryConfig};
use axon_channel_connector::error::ConnectorError;
use axon_channel_connector::identity::ClientIdentity;
use axon_channel_connector::query::{HandlerError, QueryChannel, QueryHandler};
use axon_channel_connector::testing::FakeQueryTransport;
use axon_channel_connector::wire::query;

fn fast_config() -> ChannelConfig {
    ChannelConfig {
        permits: 10,
        flow_control_batch: 5,
        reconnect_backoff: Duration::from_millis(15),
    }
}

async fn wait_until(mut predicate: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition did not become true in time");
}

struct Canned(Vec<u8>);

#[async_trait::async_trait]
impl QueryHandler for Canned {
    async fn handle(&self, _query: query::Query) -> Result<Vec<u8>, HandlerError> {
        Ok(self.0.clone())
    }
}

fn sample_query(message_id: &str) -> query::Query {
    query::Query {
        instruction_id: String::new(),
        message_id: message_id.into(),
        query_name: "GetUser".into(),
        result_name: "R".into(),
        payload: Vec::new(),
    }
}

#[tokio::test]
async fn initial_flow_control_grant_is_sent_on_connect() {
    let transport = Arc::new(FakeQueryTransport::new());
    let channel = QueryChannel::new(ClientIdentity::new("c1", "comp"), transport.clone(), &fast_config());
    channel.spawn();
    wait_until(|| channel.is_connected()).await;

    wait_until(|| {
        transport
            .sent_frames()
            .iter()
            .any(|f| matches!(f, query::Outbound::FlowControl(_)))
    })
    .await;

    let grants: Vec<_> = transport
        .sent_frames()
        .into_iter()
        .filter_map(|frame| match frame {
            query::Outbound::FlowControl(fc) => Some(fc.permits),
            _ => None,
        })
        .collect();
    assert_eq!(grants, vec![10], "initial grant should equal the configured permits, exactly once");
}

#[tokio::test]
async fn refill_is_sent_after_consuming_a_full_batch_of_inbound_frames() {
    let transport = Arc::new(FakeQueryTransport::new());
    let channel = QueryChannel::new(ClientIdentity::new("c1", "comp"), transport.clone(), &fast_config());
    channel.spawn();
    wait_until(|| channel.is_connected()).await;

    // Wait for the initial grant first so only the refill is at stake below.
    wait_until(|| {
        transport
            .sent_frames()
            .iter()
            .any(|f| matches!(f, query::Outbound::FlowControl(_)))
    })
    .await;

    for i in 0..5 {
        transport.push_inbound(Ok(query::Inbound::Query(sample_query(&format!("m-{i}")))));
    }

    wait_until(|| {
        transport
            .sent_frames()
            .iter()
            .filter(|f| matches!(f, query::Outbound::FlowControl(_)))
            .count()
            >= 2
    })
    .await;

    let grants: Vec<_> = transport
        .sent_frames()
        .into_iter()
        .filter_map(|frame| match frame {
            query::Outbound::FlowControl(fc) => Some(fc.permits),
            _ => None,
        })
        .collect();
    assert_eq!(
        grants,
        vec![10, 5],
        "the initial grant is the configured permits, then one refill of exactly the batch size"
    );
}

#[tokio::test]
async fn fan_in_emits_one_complete_after_every_handler_finishes() {
    let transport = Arc::new(FakeQueryTransport::new());
    let channel = QueryChannel::new(ClientIdentity::new("c1", "comp"), transport.clone(), &fast_config());
    channel.spawn();
    wait_until(|| channel.is_connected()).await;

    let (_r1, acks1) = channel.register_query_handler(Arc::new(Canned(b"R1".to_vec())), "GetUser", "R");
    let (_r2, acks2) = channel.register_query_handler(Arc::new(Canned(b"R2".to_vec())), "GetUser", "R");
    tokio::spawn(acks1);
    tokio::spawn(acks2);

    transport.push_inbound(Ok(query::Inbound::Query(sample_query("q1"))));

    wait_until(|| {
        transport
            .sent_frames()
            .iter()
            .filter(|f| matches!(f, query::Outbound::QueryComplete(_)))
            .count()
            >= 1
    })
    .await;

    let sent = transport.sent_frames();
    let responses: Vec<_> = sent
        .iter()
        .filter_map(|f| match f {
            query::Outbound::QueryResponse(r) => Some(r),
            _ => None,
        })
        .collect();
    let completes: Vec<_> = sent
        .iter()
        .filter(|f| matches!(f, query::Outbound::QueryComplete(_)))
        .collect();

    assert_eq!(responses.len(), 2);
    assert!(responses.iter().all(|r| r.request_identifier == "q1"));
    assert_eq!(completes.len(), 1);
}

#[tokio::test]
async fn query_with_no_handler_gets_an_error_response_and_a_complete() {
    let transport = Arc::new(FakeQueryTransport::new());
    let channel = QueryChannel::new(ClientIdentity::new("c1", "comp"), transport.clone(), &fast_config());
    channel.spawn();
    wait_until(|| channel.is_connected()).await;

    transport.push_inbound(Ok(query::Inbound::Query(sample_query("q-lonely"))));

    wait_until(|| {
        transport
            .sent_frames()
            .iter()
            .any(|f| matches!(f, query::Outbound::QueryComplete(_)))
    })
    .await;

    let sent = transport.sent_frames();
    let response = sent
        .iter()
        .find_map(|f| match f {
            query::Outbound::QueryResponse(r) => Some(r),
            _ => None,
        })
        .expect("expected an error response");
    assert_eq!(response.error_code.as_deref(), Some("NO_HANDLER_FOR_QUERY"));
    assert_eq!(response.request_identifier, "q-lonely");
}

#[tokio::test]
async fn subscription_query_fetches_initial_result_lazily_and_caches_it() {
    let transport = Arc::new(FakeQueryTransport::new());
    transport.queue_subscription_response(Ok(vec![
        query::SubscriptionQueryResponse::InitialResult {
            subscription_id: "s1".into(),
            payload: b"init".to_vec(),
        },
        query::SubscriptionQueryResponse::Update {
            subscription_id: "s1".into(),
            payload: b"u1".to_vec(),
        },
        query::SubscriptionQueryResponse::Update {
            subscription_id: "s1".into(),
            payload: b"u2".to_vec(),
        },
        query::SubscriptionQueryResponse::Complete {
            subscription_id: "s1".into(),
        },
    ]));
    let channel = QueryChannel::new(ClientIdentity::new("c1", "comp"), transport.clone(), &fast_config());

    let session = channel
        .subscription_query(sample_query("sub-1"), &SubscriptionQueryConfig::default())
        .await
        .unwrap();

    assert!(transport.subscription_sent_frames().is_empty());

    let first = session.initial_result().await.unwrap();
    let second = session.initial_result().await.unwrap();
    assert_eq!(first, b"init".to_vec());
    assert_eq!(second, b"init".to_vec());

    let get_initial_count = transport
        .subscription_sent_frames()
        .iter()
        .filter(|f| matches!(f, query::SubscriptionQueryRequest::GetInitialResult { .. }))
        .count();
    assert_eq!(get_initial_count, 1, "initial result must be requested at most once");

    let updates: Vec<_> = session.updates().collect::<Vec<_>>().await;
    let values: Vec<Vec<u8>> = updates.into_iter().map(|u| u.unwrap()).collect();
    assert_eq!(values, vec![b"u1".to_vec(), b"u2".to_vec()]);
}

#[tokio::test]
async fn provider_side_get_initial_result_runs_handler_once_and_replies() {
    let transport = Arc::new(FakeQueryTransport::new());
    let channel = QueryChannel::new(ClientIdentity::new("c1", "comp"), transport.clone(), &fast_config());
    channel.spawn();
    wait_until(|| channel.is_connected()).await;

    let (_reg, acks) = channel.register_query_handler(Arc::new(Canned(b"initial".to_vec())), "GetUser", "R");
    tokio::spawn(acks);

    transport.push_inbound(Ok(query::Inbound::SubscriptionQueryRequest(
        query::SubscriptionQueryRequest::GetInitialResult {
            subscription_id: "peer-sub-1".into(),
            query: sample_query("q-peer-1"),
        },
    )));

    wait_until(|| {
        transport.sent_frames().iter().any(|f| {
            matches!(
                f,
                query::Outbound::SubscriptionQueryResponse(
                    query::SubscriptionQueryResponse::InitialResult { .. }
                )
            )
        })
    })
    .await;

    let sent = transport.sent_frames();
    let initial = sent
        .iter()
        .find_map(|f| match f {
            query::Outbound::SubscriptionQueryResponse(
                query::SubscriptionQueryResponse::InitialResult { subscription_id, payload },
            ) => Some((subscription_id.clone(), payload.clone())),
            _ => None,
        })
        .expect("expected an initial-result frame");
    assert_eq!(initial.0, "peer-sub-1");
    assert_eq!(initial.1, b"initial".to_vec());
}

#[tokio::test]
async fn provider_side_subscribe_streams_one_update_then_completes() {
    let transport = Arc::new(FakeQueryTransport::new());
    let channel = QueryChannel::new(ClientIdentity::new("c1", "comp"), transport.clone(), &fast_config());
    channel.spawn();
    wait_until(|| channel.is_connected()).await;

    let (_reg, acks) = channel.register_query_handler(Arc::new(Canned(b"push".to_vec())), "GetUser", "R");
    tokio::spawn(acks);

    transport.push_inbound(Ok(query::Inbound::SubscriptionQueryRequest(
        query::SubscriptionQueryRequest::Subscribe {
            subscription_id: "peer-sub-2".into(),
            query: sample_query("q-peer-2"),
        },
    )));

    wait_until(|| {
        transport.sent_frames().iter().any(|f| {
            matches!(
                f,
                query::Outbound::SubscriptionQueryResponse(query::SubscriptionQueryResponse::Complete { .. })
            )
        })
    })
    .await;

    let sent = transport.sent_frames();
    let updates: Vec<_> = sent
        .iter()
        .filter(|f| {
            matches!(
                f,
                query::Outbound::SubscriptionQueryResponse(query::SubscriptionQueryResponse::Update { .. })
            )
        })
        .collect();
    let completes: Vec<_> = sent
        .iter()
        .filter(|f| {
            matches!(
                f,
                query::Outbound::SubscriptionQueryResponse(query::SubscriptionQueryResponse::Complete { .. })
            )
        })
        .collect();
    assert_eq!(updates.len(), 1, "handler runs once, producing exactly one update");
    assert_eq!(completes.len(), 1);

    // A subsequent Unsubscribe for the same id is a no-op: no extra frames.
    let before = transport.sent_frames().len();
    transport.push_inbound(Ok(query::Inbound::SubscriptionQueryRequest(
        query::SubscriptionQueryRequest::Unsubscribe {
            subscription_id: "peer-sub-2".into(),
        },
    )));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(transport.sent_frames().len(), before);
}

#[tokio::test]
async fn disconnect_stops_the_reconnect_loop() {
    let transport = Arc::new(FakeQueryTransport::new());
    let channel = QueryChannel::new(ClientIdentity::new("c1", "comp"), transport.clone(), &fast_config());
    channel.spawn();
    wait_until(|| channel.is_connected()).await;

    let calls_before = transport.open_stream_call_count();
    channel.disconnect().await;
    assert!(!channel.is_connected());

    // End the inbound stream the way a dropped connection would; a live loop
    // would reconnect from here.
    transport.push_inbound(Err(ConnectorError::Transport {
        channel: "query",
        reason: "stream closed".into(),
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        transport.open_stream_call_count(),
        calls_before,
        "disconnect must stop the run loop instead of letting it reconnect"
    );
    assert!(!channel.is_connected());
}
