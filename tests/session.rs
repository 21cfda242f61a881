mod support;

use comfoair::properties::{FAN_SPEED_SETTING, OUTDOOR_AIR_TEMPERATURE};
use comfoair::protocol::{Operation, ResultCode};
use comfoair::{
    encode_frame, ClientConfig, ComfoError, PropertyCallback, PropertyValue, ReconnectConfig,
    Session, SessionEvent, SessionState, Value,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::{eventually, MockUnit};
use tokio::sync::broadcast;

const PIN: u32 = 1234;

fn fast_config() -> ClientConfig {
    ClientConfig {
        request_timeout: Duration::from_millis(300),
        connect_timeout: Duration::from_secs(1),
        keepalive_interval: Duration::from_millis(100),
        watchdog_timeout: Duration::from_millis(400),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            jitter: 0.0,
            max_retries: Some(3),
        },
        ..ClientConfig::default()
    }
}

fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> PropertyCallback {
    let log = log.clone();
    Arc::new(move |value: &PropertyValue| {
        log.lock().unwrap().push(format!("{}={}", name, value.value));
    })
}

fn drain_states(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionState> {
    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    states
}

async fn connect(unit: &MockUnit) -> (Session, broadcast::Receiver<SessionEvent>) {
    let (events, rx) = broadcast::channel(256);
    let session = Session::connect(unit.descriptor(), PIN, fast_config(), events)
        .await
        .unwrap();
    (session, rx)
}

#[tokio::test]
async fn test_connect_handshakes_then_registers() {
    let unit = MockUnit::start(PIN).await;
    let (session, mut rx) = connect(&unit).await;

    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(
        drain_states(&mut rx),
        vec![
            SessionState::Connecting,
            SessionState::Registering,
            SessionState::Authenticated
        ]
    );

    let operations = unit.operations();
    assert_eq!(operations[0], Operation::Handshake);
    assert!(matches!(
        &operations[1],
        Operation::Register { pincode: PIN, device_name, .. } if device_name == "comfoair-rs"
    ));

    session.close().await;
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_auth_nack_returns_to_disconnected() {
    let unit = MockUnit::start(PIN).await;
    let (events, mut rx) = broadcast::channel(64);

    let result = Session::connect(unit.descriptor(), 9999, fast_config(), events).await;

    assert!(matches!(
        result,
        Err(ComfoError::Authentication(ResultCode::NotAllowed))
    ));
    assert_eq!(
        drain_states(&mut rx),
        vec![
            SessionState::Connecting,
            SessionState::Registering,
            SessionState::Disconnected
        ]
    );
}

#[tokio::test]
async fn test_connect_refused() {
    let unit = MockUnit::start(PIN).await;
    let descriptor = unit.descriptor();
    drop(unit);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (events, _rx) = broadcast::channel(16);
    let result = Session::connect(descriptor, PIN, fast_config(), events).await;
    assert!(matches!(result, Err(ComfoError::Connect(_))));
}

#[tokio::test]
async fn test_two_listeners_share_one_wire_subscription() {
    let unit = MockUnit::start(PIN).await;
    let (session, _rx) = connect(&unit).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let fan = FAN_SPEED_SETTING.id;

    let a = session.subscribe(fan, recorder(&log, "a")).await.unwrap();
    let b = session.subscribe(fan, recorder(&log, "b")).await.unwrap();
    assert_eq!(unit.subscribes(fan), 1);
    assert_eq!(session.state(), SessionState::Streaming);

    unit.push(PropertyValue::new(fan, Value::Integer(2)));
    unit.push(PropertyValue::new(fan, Value::Integer(3)));
    assert!(eventually(|| log.lock().unwrap().len() == 4).await);
    assert_eq!(*log.lock().unwrap(), vec!["a=2", "b=2", "a=3", "b=3"]);

    session.unsubscribe(a).await.unwrap();
    assert_eq!(unit.unsubscribes(fan), 0);
    session.unsubscribe(b).await.unwrap();
    assert_eq!(unit.unsubscribes(fan), 1);

    // nobody listens any more
    unit.push(PropertyValue::new(fan, Value::Integer(1)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(log.lock().unwrap().len(), 4);

    session.close().await;
}

#[tokio::test]
async fn test_malformed_frame_is_dropped() {
    let unit = MockUnit::start(PIN).await;
    let (session, _rx) = connect(&unit).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let outdoor = OUTDOOR_AIR_TEMPERATURE.id;

    session.subscribe(outdoor, recorder(&log, "t")).await.unwrap();

    // push header with a truncated property id
    unit.send_raw(encode_frame(&[0x30, 0x00, 0x00, 0x00, 0x01]).unwrap());
    unit.push(PropertyValue::new(outdoor, Value::Float(7.5)));

    assert!(eventually(|| log.lock().unwrap().len() == 1).await);
    assert_eq!(*log.lock().unwrap(), vec!["t=7.5"]);
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(unit.accepted(), 1);

    session.close().await;
}

#[tokio::test]
async fn test_read_times_out_without_killing_the_session() {
    let unit = MockUnit::start(PIN).await;
    unit.set_value(FAN_SPEED_SETTING.id, Value::Integer(1));
    let (session, _rx) = connect(&unit).await;

    unit.set_silent_reads(true);
    assert!(matches!(
        session.read(FAN_SPEED_SETTING.id).await,
        Err(ComfoError::Timeout)
    ));

    unit.set_silent_reads(false);
    assert_eq!(
        session.read(FAN_SPEED_SETTING.id).await.unwrap(),
        Value::Integer(1)
    );
    assert_eq!(session.state(), SessionState::Authenticated);

    session.close().await;
}

#[tokio::test]
async fn test_split_length_header_is_reassembled() {
    let unit = MockUnit::start(PIN).await;
    unit.set_split_writes(true);
    unit.set_value(OUTDOOR_AIR_TEMPERATURE.id, Value::Float(12.25));

    let (session, _rx) = connect(&unit).await;
    assert_eq!(
        session.read(OUTDOOR_AIR_TEMPERATURE.id).await.unwrap(),
        Value::Float(12.25)
    );

    session.close().await;
}

#[tokio::test]
async fn test_reconnect_restores_subscriptions() {
    let unit = MockUnit::start(PIN).await;
    let (session, mut rx) = connect(&unit).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let fan = FAN_SPEED_SETTING.id;
    session.subscribe(fan, recorder(&log, "a")).await.unwrap();
    drain_states(&mut rx);

    unit.hang_up();

    assert!(eventually(|| unit.accepted() == 2 && unit.subscribes(fan) == 2).await);
    assert!(eventually(|| session.state() == SessionState::Streaming).await);
    assert_eq!(
        drain_states(&mut rx),
        vec![
            SessionState::Closing,
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::Registering,
            SessionState::Authenticated,
            SessionState::Streaming
        ]
    );

    unit.push(PropertyValue::new(fan, Value::Integer(3)));
    assert!(eventually(|| log.lock().unwrap().len() == 1).await);

    session.close().await;
}

#[tokio::test]
async fn test_subscribe_during_reconnect_is_sent_once() {
    let unit = MockUnit::start(PIN).await;
    let (session, _rx) = connect(&unit).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let fan = FAN_SPEED_SETTING.id;
    let outdoor = OUTDOOR_AIR_TEMPERATURE.id;
    session.subscribe(fan, recorder(&log, "fan")).await.unwrap();

    let mut states = session.watch_state();
    unit.hang_up();
    states.wait_for(|s| !s.is_authenticated()).await.unwrap();
    states.wait_for(|s| s.is_authenticated()).await.unwrap();

    // lands while the restore of the earlier subscription may still be running
    session.subscribe(outdoor, recorder(&log, "outdoor")).await.unwrap();

    assert!(eventually(|| unit.subscribes(fan) == 2).await);
    assert_eq!(unit.subscribes(outdoor), 1);
    assert_eq!(unit.accepted(), 2);

    unit.push(PropertyValue::new(outdoor, Value::Float(4.5)));
    assert!(eventually(|| log.lock().unwrap().len() == 1).await);
    assert_eq!(*log.lock().unwrap(), vec!["outdoor=4.5"]);

    session.close().await;
}

#[tokio::test]
async fn test_exhausted_sequence_space_drops_the_link() {
    let unit = MockUnit::start(PIN).await;
    unit.set_silent_reads(true);
    let (events, mut rx) = broadcast::channel(256);
    let config = ClientConfig {
        request_timeout: Duration::from_secs(60),
        watchdog_timeout: Duration::from_secs(10),
        ..fast_config()
    };
    let session = Arc::new(
        Session::connect(unit.descriptor(), PIN, config, events)
            .await
            .unwrap(),
    );
    drain_states(&mut rx);

    // occupy every usable sequence number with a read the unit never answers
    let readers: Vec<_> = (0..u16::MAX)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.read(FAN_SPEED_SETTING.id).await })
        })
        .collect();
    let is_read = |op: &Operation| matches!(op, Operation::Read(_));
    for _ in 0..3000 {
        if unit.count(is_read) == u16::MAX as usize {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(unit.count(is_read), u16::MAX as usize);
    assert_eq!(session.state(), SessionState::Authenticated);

    assert!(matches!(
        session.read(FAN_SPEED_SETTING.id).await,
        Err(ComfoError::DuplicateSequence(_))
    ));
    for reader in readers {
        assert!(matches!(reader.await.unwrap(), Err(ComfoError::Cancelled)));
    }

    assert!(eventually(|| unit.accepted() == 2).await);
    assert!(eventually(|| session.state() == SessionState::Authenticated).await);
    let states = drain_states(&mut rx);
    assert_eq!(states[0], SessionState::Closing);
    assert_eq!(states.last(), Some(&SessionState::Authenticated));

    session.close().await;
}

#[tokio::test]
async fn test_gives_up_after_retry_ceiling() {
    let unit = MockUnit::start(PIN).await;
    let (session, mut rx) = connect(&unit).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    session
        .subscribe(FAN_SPEED_SETTING.id, recorder(&log, "a"))
        .await
        .unwrap();

    unit.shut_down();

    assert!(eventually(|| session.state() == SessionState::Failed).await);
    let mut failed = false;
    while let Ok(event) = rx.try_recv() {
        failed |= matches!(event, SessionEvent::Failed(_));
    }
    assert!(failed);

    assert!(matches!(
        session.subscribe(FAN_SPEED_SETTING.id, recorder(&log, "b")).await,
        Err(ComfoError::SessionFailed(_))
    ));
    assert!(matches!(
        session.read(FAN_SPEED_SETTING.id).await,
        Err(ComfoError::NotAuthenticated(SessionState::Failed))
    ));
}

#[tokio::test]
async fn test_watchdog_drops_silent_link() {
    let unit = MockUnit::start(PIN).await;
    unit.set_answer_keepalive(false);
    let (session, _rx) = connect(&unit).await;

    assert!(eventually(|| unit.keepalives() >= 2).await);
    assert!(eventually(|| unit.accepted() >= 2).await);

    session.close().await;
}

#[tokio::test]
async fn test_keepalives_keep_the_link_up() {
    let unit = MockUnit::start(PIN).await;
    let (session, _rx) = connect(&unit).await;

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(unit.keepalives() >= 3);
    assert_eq!(unit.accepted(), 1);
    assert_eq!(session.state(), SessionState::Authenticated);

    session.close().await;
}

#[tokio::test]
async fn test_close_cancels_pending_requests() {
    let unit = MockUnit::start(PIN).await;
    unit.set_silent_reads(true);
    let (session, _rx) = connect(&unit).await;
    let session = Arc::new(session);

    let reader = tokio::spawn({
        let session = session.clone();
        async move { session.read(FAN_SPEED_SETTING.id).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    session.close().await;
    assert!(matches!(reader.await.unwrap(), Err(ComfoError::Cancelled)));
    assert_eq!(session.state(), SessionState::Disconnected);
}
