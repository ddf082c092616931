//! MQTT session tests against an in-process broker, over TCP and mutual TLS


use heartrate_mqtt::dispatcher::LoggingDispatcher;
use heartrate_mqtt::lifecycle::{LifecycleController, LifecycleSettings};
use heartrate_mqtt::protocol::{Message, ReadingEnvelope, TopicError};
use heartrate_mqtt::tls::{CredentialBundle, TlsContext};
use heartrate_mqtt::transport::mqtt::{ConnectionState, MqttError, MqttSession, SharedHandler};
use heartrate_mqtt::transport::Transport;
use rumqttc::{ConnectReturnCode, QoS};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use test_helpers::{
    broker_tls_config, eventually, fixture, BrokerEvent, FakeBroker, FakeBrokerOptions,
    SharedBuffer,
};

const WAIT: Duration = Duration::from_secs(5);
const GRACE: Duration = Duration::from_millis(250);

fn recorder() -> (SharedHandler, Arc<Mutex<Vec<Message>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: SharedHandler = Arc::new(move |m: &Message| sink.lock().unwrap().push(m.clone()));
    (handler, seen)
}

/// Client credentials from the fixtures, trusting `broker_ca` for the server
fn client_tls(broker_ca: &str) -> TlsContext {
    let bundle = CredentialBundle::load(
        &fixture(broker_ca),
        &fixture("client.cert.pem"),
        &fixture("client.key.pem"),
    )
    .unwrap();
    TlsContext::from_bundle(&bundle).unwrap()
}

#[tokio::test]
async fn test_connect_uses_client_identity_and_clean_session() {
    let broker = FakeBroker::start().await;
    let (handler, _) = recorder();

    let session = MqttSession::connect(broker.session_config("someThing"), handler)
        .await
        .unwrap();

    assert_eq!(session.connection_state(), ConnectionState::Connected);
    assert_eq!(
        broker.events().first(),
        Some(&BrokerEvent::Connect {
            client_id: "someThing".to_string(),
            clean_session: true,
            keep_alive: 30,
        })
    );

    session.disconnect(GRACE).await;
}

#[tokio::test]
async fn test_mutual_tls_session_presents_client_certificate() {
    let broker = FakeBroker::start_tls(broker_tls_config("root_ca.pem")).await;
    let output = SharedBuffer::default();

    let session = MqttSession::connect(
        broker.tls_session_config("someThing", client_tls("broker_ca.pem")),
        LoggingDispatcher::new(output.clone()).into_shared(),
    )
    .await
    .unwrap();

    assert_eq!(session.connection_state(), ConnectionState::Connected);
    assert_eq!(broker.client_certificates(), Some(1));

    session.subscribe("/dummy", QoS::AtMostOnce, None).await.unwrap();
    let payload = ReadingEnvelope::heartrate(80).to_bytes().unwrap();
    session
        .publish("/dummy", payload, QoS::AtMostOnce, false)
        .await
        .unwrap();

    let expected = "TOPIC: /dummy\nMSG: {\"message\":{\"event\":\"heartrate\",\"data\":80}}\n";
    assert!(eventually(WAIT, || output.contents() == expected).await);

    session.disconnect(GRACE).await;
}

#[tokio::test]
async fn test_untrusted_broker_certificate_fails_connect() {
    let broker = FakeBroker::start_tls(broker_tls_config("root_ca.pem")).await;
    let (handler, _) = recorder();

    // root_ca.pem did not issue the broker certificate
    let result = MqttSession::connect(
        broker.tls_session_config("someThing", client_tls("root_ca.pem")),
        handler,
    )
    .await;

    let err = match result {
        Err(e) => e,
        Ok(_) => panic!("connect should fail against an untrusted broker"),
    };
    assert!(matches!(err, MqttError::ConnectFailed(_)));
    assert!(err.to_string().contains("UnknownIssuer"), "{err}");
    assert!(broker.events().is_empty());
}

#[tokio::test]
async fn test_broker_rejecting_client_certificate_fails_connect() {
    // The broker only accepts clients issued by the secondary CA
    let broker = FakeBroker::start_tls(broker_tls_config("second_ca.pem")).await;
    let (handler, _) = recorder();

    let result = MqttSession::connect(
        broker.tls_session_config("someThing", client_tls("broker_ca.pem")),
        handler,
    )
    .await;

    assert!(matches!(result, Err(MqttError::ConnectFailed(_))));
    assert!(broker.events().is_empty());
}

#[tokio::test]
async fn test_refused_connack_fails_connect_with_reason() {
    let broker = FakeBroker::start_refusing(ConnectReturnCode::NotAuthorized).await;
    let (handler, _) = recorder();

    let result = MqttSession::connect(broker.session_config("someThing"), handler).await;

    let err = match result {
        Err(e) => e,
        Ok(_) => panic!("connect should fail when CONNACK refuses"),
    };
    assert!(matches!(err, MqttError::ConnectFailed(_)));
    assert!(err.to_string().contains("NotAuthorized"), "{err}");
    assert!(matches!(
        broker.events().first(),
        Some(BrokerEvent::Connect { .. })
    ));
}

#[tokio::test]
async fn test_published_reading_reaches_dispatcher_unchanged() {
    let broker = FakeBroker::start().await;
    let output = SharedBuffer::default();
    let dispatcher = LoggingDispatcher::new(output.clone()).into_shared();

    let session = MqttSession::connect(broker.session_config("someThing"), dispatcher)
        .await
        .unwrap();
    session.subscribe("/dummy", QoS::AtMostOnce, None).await.unwrap();

    let payload = ReadingEnvelope::heartrate(80).to_bytes().unwrap();
    session
        .publish("/dummy", payload, QoS::AtMostOnce, false)
        .await
        .unwrap();

    let expected = "TOPIC: /dummy\nMSG: {\"message\":{\"event\":\"heartrate\",\"data\":80}}\n";
    assert!(eventually(WAIT, || output.contents() == expected).await);

    session.disconnect(GRACE).await;
}

#[tokio::test]
async fn test_qos1_publish_waits_for_puback() {
    let broker = FakeBroker::start().await;
    let (handler, _) = recorder();
    let session = MqttSession::connect(broker.session_config("qos1"), handler)
        .await
        .unwrap();

    tokio::time::timeout(
        WAIT,
        session.publish("sensors/hr", b"72".to_vec(), QoS::AtLeastOnce, false),
    )
    .await
    .expect("PUBACK should arrive")
    .unwrap();

    assert_eq!(session.inflight_publishes(), 0);
    session.disconnect(GRACE).await;
}

#[tokio::test]
async fn test_qos2_publish_waits_for_pubcomp() {
    let broker = FakeBroker::start().await;
    let (handler, _) = recorder();
    let session = MqttSession::connect(broker.session_config("qos2"), handler)
        .await
        .unwrap();

    tokio::time::timeout(
        WAIT,
        session.publish("sensors/hr", b"72".to_vec(), QoS::ExactlyOnce, true),
    )
    .await
    .expect("PUBCOMP should arrive")
    .unwrap();

    assert!(broker.events().contains(&BrokerEvent::Publish {
        topic: "sensors/hr".to_string(),
        payload: b"72".to_vec(),
        qos: 2,
        retain: true,
    }));
    session.disconnect(GRACE).await;
}

#[tokio::test]
async fn test_disconnect_is_bounded_with_unacknowledged_publish() {
    let broker = FakeBroker::start_with(FakeBrokerOptions {
        withhold_acks: true,
        ..FakeBrokerOptions::default()
    })
    .await;
    let (handler, _) = recorder();
    let session = Arc::new(
        MqttSession::connect(broker.session_config("withheld"), handler)
            .await
            .unwrap(),
    );

    let publisher = session.clone();
    let pending = tokio::spawn(async move {
        publisher
            .publish("/dummy", b"never acked".to_vec(), QoS::AtLeastOnce, false)
            .await
    });
    assert!(eventually(WAIT, || session.inflight_publishes() == 1).await);

    let started = Instant::now();
    session.disconnect(GRACE).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(
        session.connection_state(),
        ConnectionState::Disconnected(_)
    ));

    let result = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(MqttError::PublishFailed(_))));
}

#[tokio::test]
async fn test_disconnect_sends_disconnect_packet() {
    let broker = FakeBroker::start().await;
    let (handler, _) = recorder();
    let session = MqttSession::connect(broker.session_config("bye"), handler)
        .await
        .unwrap();

    session.disconnect(GRACE).await;

    assert!(
        broker
            .wait_for(WAIT, |events| events.contains(&BrokerEvent::Disconnect))
            .await
    );
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_rejected_subscription_fails() {
    let broker = FakeBroker::start_with(FakeBrokerOptions {
        reject_filters: vec!["forbidden/#".to_string()],
        ..FakeBrokerOptions::default()
    })
    .await;
    let (handler, _) = recorder();
    let session = MqttSession::connect(broker.session_config("rejected"), handler)
        .await
        .unwrap();

    let result = session.subscribe("forbidden/#", QoS::AtMostOnce, None).await;
    assert!(matches!(result, Err(MqttError::SubscribeFailed(_))));

    // The session stays usable after a refused filter
    session.subscribe("/dummy", QoS::AtMostOnce, None).await.unwrap();
    session.disconnect(GRACE).await;
}

#[tokio::test]
async fn test_filter_handler_takes_precedence_over_default() {
    let broker = FakeBroker::start().await;
    let (default_handler, default_seen) = recorder();
    let (sensor_handler, sensor_seen) = recorder();
    let session = MqttSession::connect(broker.session_config("routing"), default_handler)
        .await
        .unwrap();

    session
        .subscribe("sensors/#", QoS::AtMostOnce, Some(sensor_handler))
        .await
        .unwrap();
    session.subscribe("/dummy", QoS::AtMostOnce, None).await.unwrap();

    session
        .publish("sensors/wrist/hr", b"80".to_vec(), QoS::AtMostOnce, false)
        .await
        .unwrap();
    session
        .publish("/dummy", b"hello".to_vec(), QoS::AtMostOnce, false)
        .await
        .unwrap();

    assert!(
        eventually(WAIT, || {
            sensor_seen.lock().unwrap().len() == 1 && default_seen.lock().unwrap().len() == 1
        })
        .await
    );
    assert_eq!(sensor_seen.lock().unwrap()[0].topic, "sensors/wrist/hr");
    assert_eq!(default_seen.lock().unwrap()[0].payload.as_ref(), b"hello");

    session.disconnect(GRACE).await;
}

#[tokio::test]
async fn test_refused_resubscribe_keeps_existing_handler() {
    let broker = FakeBroker::start().await;
    let (default_handler, default_seen) = recorder();
    let (first_handler, first_seen) = recorder();
    let (second_handler, second_seen) = recorder();
    let session = MqttSession::connect(broker.session_config("resubscribe"), default_handler)
        .await
        .unwrap();

    session
        .subscribe("sensors/#", QoS::AtMostOnce, Some(first_handler))
        .await
        .unwrap();

    broker.reject_filter("sensors/#");
    let result = session
        .subscribe("sensors/#", QoS::AtMostOnce, Some(second_handler))
        .await;
    assert!(matches!(result, Err(MqttError::SubscribeFailed(_))));

    session
        .publish("sensors/wrist/hr", b"80".to_vec(), QoS::AtMostOnce, false)
        .await
        .unwrap();

    assert!(eventually(WAIT, || first_seen.lock().unwrap().len() == 1).await);
    assert!(second_seen.lock().unwrap().is_empty());
    assert!(default_seen.lock().unwrap().is_empty());

    session.disconnect(GRACE).await;
}

#[tokio::test]
async fn test_invalid_topics_are_rejected_before_sending() {
    let broker = FakeBroker::start().await;
    let (handler, _) = recorder();
    let session = MqttSession::connect(broker.session_config("topics"), handler)
        .await
        .unwrap();

    let result = session
        .publish("sensors/+/hr", b"x".to_vec(), QoS::AtMostOnce, false)
        .await;
    assert!(matches!(
        result,
        Err(MqttError::InvalidTopic(TopicError::WildcardInName(_)))
    ));

    let result = session.subscribe("sensors/#/hr", QoS::AtMostOnce, None).await;
    assert!(matches!(result, Err(MqttError::InvalidTopic(_))));

    session.disconnect(GRACE).await;
}

#[tokio::test]
async fn test_operations_after_disconnect_fail_with_not_connected() {
    let broker = FakeBroker::start().await;
    let (handler, _) = recorder();
    let session = MqttSession::connect(broker.session_config("closed"), handler)
        .await
        .unwrap();
    session.disconnect(GRACE).await;

    let result = session
        .publish("/dummy", b"x".to_vec(), QoS::AtMostOnce, false)
        .await;
    assert!(matches!(result, Err(MqttError::NotConnected { .. })));

    let result = session.subscribe("/dummy", QoS::AtMostOnce, None).await;
    assert!(matches!(result, Err(MqttError::NotConnected { .. })));
}

#[tokio::test]
async fn test_lifecycle_round_trip_over_session() {
    let broker = FakeBroker::start().await;
    let output = SharedBuffer::default();
    let session = MqttSession::connect(
        broker.session_config("someThing"),
        LoggingDispatcher::new(output.clone()).into_shared(),
    )
    .await
    .unwrap();

    let settings = LifecycleSettings {
        publish_delay: Duration::from_millis(100),
        ..LifecycleSettings::default()
    };
    let mut controller = LifecycleController::new(session, settings);
    controller.start().await.unwrap();

    let printed = output.clone();
    let shutdown = async move {
        eventually(WAIT, || printed.contents().contains("MSG: ")).await;
    };
    controller.run_until(shutdown).await.unwrap();

    assert_eq!(
        output.contents(),
        "TOPIC: /dummy\nMSG: {\"message\":{\"event\":\"heartrate\",\"data\":80}}\n"
    );
    assert!(matches!(
        controller.transport().connection_state(),
        ConnectionState::Disconnected(_)
    ));
    assert!(
        broker
            .wait_for(WAIT, |events| events.contains(&BrokerEvent::Disconnect))
            .await
    );
}
