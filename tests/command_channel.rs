//! Integration tests for [`CommandChannel`] driven against
//! [`FakeCommandTransport`], covering the connector's testable properties.

use std::sync::Arc;
use std::time::Duration;

use axon_channel_connector::command::{CommandChannel, CommandHandler, HandlerError};
use axon_channel_connector::config::ChannelConfig;
use axon_channel_connector::error::ConnectorError;
use axon_channel_connector::identity::ClientIdentity;
use axon_channel_connector::testing::FakeCommandTransport;
use axon_channel_connector::wire::command;

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

struct Echo;

#[async_trait::async_trait]
impl CommandHandler for Echo {
    async fn handle(&self, command: command::Command) -> Result<Vec<u8>, HandlerError> {
        Ok(command.payload)
    }
}

#[tokio::test]
async fn initial_flow_control_grant_is_sent_on_connect() {
    let transport = Arc::new(FakeCommandTransport::new());
    let channel = CommandChannel::new(
        ClientIdentity::new("client-1", "comp"),
        transport.clone(),
        &fast_config(),
    );
    channel.spawn();
    wait_until(|| channel.is_connected()).await;

    wait_until(|| {
        transport
            .sent_frames()
            .iter()
            .any(|f| matches!(f, command::Outbound::FlowControl(_)))
    })
    .await;

    let grants: Vec<_> = transport
        .sent_frames()
        .into_iter()
        .filter_map(|frame| match frame {
            command::Outbound::FlowControl(fc) => Some(fc.permits),
            _ => None,
        })
        .collect();
    assert_eq!(grants, vec![10], "initial grant should equal the configured permits, exactly once");
}

#[tokio::test]
async fn refill_is_sent_after_consuming_a_full_batch_of_inbound_frames() {
    let transport = Arc::new(FakeCommandTransport::new());
    let channel = CommandChannel::new(
        ClientIdentity::new("client-1", "comp"),
        transport.clone(),
        &fast_config(),
    );
    channel.spawn();
    wait_until(|| channel.is_connected()).await;

    // Wait for the initial grant first so only the refill is at stake below.
    wait_until(|| {
        transport
            .sent_frames()
            .iter()
            .any(|f| matches!(f, command::Outbound::FlowControl(_)))
    })
    .await;

    for i in 0..5 {
        transport.push_inbound(Ok(command::Inbound::Command(command::Command {
            instruction_id: String::new(),
            message_id: format!("m-{i}"),
            name: "Unhandled".into(),
            payload: Vec::new(),
            client_id: String::new(),
            component_name: String::new(),
            processing_instructions: Vec::new(),
        })));
    }

    wait_until(|| {
        transport
            .sent_frames()
            .iter()
            .filter(|f| matches!(f, command::Outbound::FlowControl(_)))
            .count()
            >= 2
    })
    .await;

    let grants: Vec<_> = transport
        .sent_frames()
        .into_iter()
        .filter_map(|frame| match frame {
            command::Outbound::FlowControl(fc) => Some(fc.permits),
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
async fn no_handler_response_echoes_message_id_with_stable_category() {
    let transport = Arc::new(FakeCommandTransport::new());
    let channel = CommandChannel::new(
        ClientIdentity::new("client-1", "comp"),
        transport.clone(),
        &fast_config(),
    );
    channel.spawn();
    wait_until(|| channel.is_connected()).await;

    transport.push_inbound(Ok(command::Inbound::Command(command::Command {
        instruction_id: "ack-me".into(),
        message_id: "msg-1".into(),
        name: "DoesNotExist".into(),
        payload: Vec::new(),
        client_id: String::new(),
        component_name: String::new(),
        processing_instructions: Vec::new(),
    })));

    wait_until(|| {
        transport
            .sent_frames()
            .iter()
            .any(|frame| matches!(frame, command::Outbound::CommandResponse(_)))
    })
    .await;

    let responses: Vec<_> = transport
        .sent_frames()
        .into_iter()
        .filter_map(|frame| match frame {
            command::Outbound::CommandResponse(response) => Some(response),
            _ => None,
        })
        .collect();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].request_identifier, "msg-1");
    assert_eq!(responses[0].error_code.as_deref(), Some("NO_HANDLER_FOR_COMMAND"));
}

#[tokio::test]
async fn routing_key_is_synthesized_from_message_id_when_absent() {
    let transport = Arc::new(FakeCommandTransport::new());
    transport.queue_dispatch_response(Ok(Some(command::CommandResponse::success(
        "whatever",
        Vec::new(),
    ))));
    let channel = CommandChannel::new(
        ClientIdentity::new("client-1", "comp"),
        transport.clone(),
        &fast_config(),
    );

    let command = command::Command {
        instruction_id: String::new(),
        message_id: "msg-42".into(),
        name: "DoThing".into(),
        payload: Vec::new(),
        client_id: String::new(),
        component_name: String::new(),
        processing_instructions: Vec::new(),
    };
    channel.send_command(command).await.unwrap();

    let sent = transport.dispatched_commands();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].routing_key(), Some("msg-42"));
}

#[tokio::test]
async fn reply_stream_completing_with_no_value_is_a_dispatch_error() {
    let transport = Arc::new(FakeCommandTransport::new());
    transport.queue_dispatch_response(Ok(None));
    let channel = CommandChannel::new(
        ClientIdentity::new("client-1", "comp"),
        transport,
        &fast_config(),
    );

    let command = command::Command {
        instruction_id: String::new(),
        message_id: "msg-1".into(),
        name: "DoThing".into(),
        payload: Vec::new(),
        client_id: String::new(),
        component_name: String::new(),
        processing_instructions: Vec::new(),
    };
    let error = channel.send_command(command).await.unwrap_err();
    assert!(matches!(error, ConnectorError::LocalDispatch { .. }));
}

#[tokio::test]
async fn reconnect_replays_every_registered_name_with_fresh_ids() {
    let transport = Arc::new(FakeCommandTransport::new());
    let channel = CommandChannel::new(
        ClientIdentity::new("client-1", "comp"),
        transport.clone(),
        &fast_config(),
    );
    channel.spawn();
    wait_until(|| channel.is_connected()).await;

    let handler = Arc::new(Echo);
    let (_registration, acks) = channel.register_handler(handler, 0, ["A", "B", "C"]);
    tokio::spawn(acks);

    wait_until(|| {
        transport
            .sent_frames()
            .iter()
            .filter(|f| matches!(f, command::Outbound::Subscribe(_)))
            .count()
            >= 3
    })
    .await;

    let first_round_ids: Vec<String> = transport
        .sent_frames()
        .into_iter()
        .filter_map(|frame| match frame {
            command::Outbound::Subscribe(subscribe) => Some(subscribe.instruction_id),
            _ => None,
        })
        .collect();
    for id in &first_round_ids {
        transport.push_inbound(Ok(command::Inbound::Ack(axon_channel_connector::wire::InstructionAck {
            instruction_id: id.clone(),
            outcome: axon_channel_connector::wire::AckOutcome::Success,
        })));
    }

    transport.push_inbound(Err(ConnectorError::Transport {
        channel: "command",
        reason: "simulated reset".into(),
    }));

    wait_until(|| {
        transport
            .sent_frames()
            .iter()
            .filter(|f| matches!(f, command::Outbound::Subscribe(_)))
            .count()
            >= 6
    })
    .await;

    let second_round: Vec<_> = transport
        .sent_frames()
        .into_iter()
        .filter_map(|frame| match frame {
            command::Outbound::Subscribe(subscribe) => Some(subscribe),
            _ => None,
        })
        .skip(3)
        .collect();
    let mut names: Vec<_> = second_round.iter().map(|s| s.command.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["A", "B", "C"]);
    for subscribe in &second_round {
        assert!(
            !first_round_ids.contains(&subscribe.instruction_id),
            "resubscription must mint a fresh instruction id"
        );
    }
}

#[tokio::test]
async fn cancelling_a_registration_twice_sends_at_most_one_unsubscribe() {
    let transport = Arc::new(FakeCommandTransport::new());
    let channel = CommandChannel::new(
        ClientIdentity::new("client-1", "comp"),
        transport.clone(),
        &fast_config(),
    );
    channel.spawn();
    wait_until(|| channel.is_connected()).await;

    let handler = Arc::new(Echo);
    let (registration, acks) = channel.register_handler(handler, 0, ["A"]);
    tokio::spawn(acks);
    wait_until(|| {
        transport
            .sent_frames()
            .iter()
            .any(|f| matches!(f, command::Outbound::Subscribe(_)))
    })
    .await;

    // Ack the subscribe so the later unsubscribe ack-wait resolves too.
    let subscribe_id = transport
        .sent_frames()
        .into_iter()
        .find_map(|frame| match frame {
            command::Outbound::Subscribe(s) => Some(s.instruction_id),
            _ => None,
        })
        .unwrap();
    transport.push_inbound(Ok(command::Inbound::Ack(axon_channel_connector::wire::InstructionAck {
        instruction_id: subscribe_id,
        outcome: axon_channel_connector::wire::AckOutcome::Success,
    })));

    let registration = Arc::new(registration);
    let first = tokio::spawn({
        let registration = registration.clone();
        async move { registration.cancel().await }
    });
    let second = tokio::spawn({
        let registration = registration.clone();
        async move { registration.cancel().await }
    });

    wait_until(|| {
        transport
            .sent_frames()
            .iter()
            .any(|f| matches!(f, command::Outbound::Unsubscribe(_)))
    })
    .await;
    if let Some(unsubscribe_id) = transport.sent_frames().into_iter().find_map(|frame| match frame {
        command::Outbound::Unsubscribe(u) => Some(u.instruction_id),
        _ => None,
    }) {
        transport.push_inbound(Ok(command::Inbound::Ack(axon_channel_connector::wire::InstructionAck {
            instruction_id: unsubscribe_id,
            outcome: axon_channel_connector::wire::AckOutcome::Success,
        })));
    }

    tokio::time::timeout(Duration::from_secs(2), async {
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    })
    .await
    .expect("both cancel calls should resolve");

    let unsubscribe_count = transport
        .sent_frames()
        .iter()
        .filter(|f| matches!(f, command::Outbound::Unsubscribe(_)))
        .count();
    assert!(unsubscribe_count <= 1, "expected at most one Unsubscribe, saw {unsubscribe_count}");
}

#[tokio::test]
async fn disconnect_stops_the_reconnect_loop() {
    let transport = Arc::new(FakeCommandTransport::new());
    let channel = CommandChannel::new(
        ClientIdentity::new("client-1", "comp"),
        transport.clone(),
        &fast_config(),
    );
    channel.spawn();
    wait_until(|| channel.is_connected()).await;

    let calls_before = transport.open_stream_call_count();
    channel.disconnect().await;
    assert!(!channel.is_connected());

    // End the inbound stream the way a dropped connection would; a live loop
    // would reconnect from here.
    transport.push_inbound(Err(ConnectorError::Transport {
        channel: "command",
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
