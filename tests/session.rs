use meditador_flash::{
    interface::PortHandle,
    targets::Chip,
    ConnectError,
    ConnectionPolicy,
    SessionState,
};
use pretty_assertions::assert_eq;

mod common;

#[test]
fn lazy_connect_keeps_the_application_running() {
    let (mut session, recorder) = common::session(ConnectionPolicy::Lazy);

    session.connect().unwrap();

    assert_eq!(
        recorder.calls(),
        vec![
            "request_port",
            "port.open(115200)",
            "port.dtr(false)",
            "port.rts(false)",
            "transport#1.new",
        ]
    );
    assert_eq!(session.state(), SessionState::Connected);
    assert!(session.port().is_some_and(|port| port.is_open()));
    assert!(session.has_transport());
    assert!(session.device().is_none());
}

#[test]
fn eager_connect_synchronizes_with_the_bootloader() {
    let (mut session, recorder) = common::session(ConnectionPolicy::Eager);

    session.connect().unwrap();

    assert_eq!(
        recorder.calls(),
        vec![
            "request_port",
            "port.open(115200)",
            "transport#1.new",
            "loader#1.new",
            "loader#1.handshake(transport#1)",
        ]
    );
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.device().map(|d| d.chip), Some(Chip::Esp32c3));
}

#[test]
fn failed_handshake_releases_everything() {
    let (mut session, recorder) = common::session(ConnectionPolicy::Eager);
    recorder.set_faults(|f| f.handshake = true);

    let err = session.connect().unwrap_err();

    assert!(matches!(err, ConnectError::Handshake(_)));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.port().is_none());
    assert!(!session.has_transport());

    let calls = recorder.calls();
    assert_eq!(
        &calls[calls.len() - 3..],
        ["loader#1.drop", "transport#1.disconnect", "port.close"]
    );
}

#[test]
fn failed_open_leaves_session_disconnected() {
    let (mut session, recorder) = common::session(ConnectionPolicy::Lazy);
    recorder.set_faults(|f| f.open = true);

    let err = session.connect().unwrap_err();

    assert!(matches!(err, ConnectError::Open { ref port, .. } if port == "/dev/ttyMOCK0"));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(recorder.count("transport#1.new"), 0);
}

#[test]
fn chooser_failures_are_told_apart() {
    let (mut session, recorder) = common::session(ConnectionPolicy::Lazy);

    recorder.set_faults(|f| f.cancel_chooser = true);
    assert!(matches!(session.connect(), Err(ConnectError::Cancelled)));

    recorder.set_faults(|f| {
        f.cancel_chooser = false;
        f.no_port = true;
    });
    assert!(matches!(session.connect(), Err(ConnectError::NoPort(_))));

    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(recorder.calls(), vec!["request_port", "request_port"]);
}

#[test]
fn connecting_twice_is_a_no_op() {
    let (mut session, recorder) = common::session(ConnectionPolicy::Eager);

    session.connect().unwrap();
    recorder.clear();
    session.connect().unwrap();

    assert!(recorder.calls().is_empty());
    assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn connect_is_rejected_while_flashing() {
    let (mut session, _recorder) = common::session(ConnectionPolicy::Lazy);
    session.connect().unwrap();

    let status = session.status();
    status.try_begin_flash().unwrap();

    assert!(matches!(
        session.connect(),
        Err(ConnectError::Busy(SessionState::Flashing))
    ));
}

#[test]
fn disconnect_tears_down_in_order() {
    let (mut session, recorder) = common::session(ConnectionPolicy::Eager);
    session.connect().unwrap();
    recorder.clear();

    session.disconnect();

    assert_eq!(
        recorder.calls(),
        vec!["loader#1.drop", "transport#1.disconnect", "port.close"]
    );
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.device().is_none());
}

#[test]
fn disconnect_keeps_going_after_a_failure() {
    let (mut session, recorder) = common::session(ConnectionPolicy::Lazy);
    session.connect().unwrap();
    recorder.set_faults(|f| f.transport_disconnect = true);
    recorder.clear();

    session.disconnect();

    assert_eq!(recorder.calls(), vec!["transport#1.disconnect", "port.close"]);
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.port().is_none());
}

#[test]
fn session_is_reusable() {
    let (mut session, recorder) = common::session(ConnectionPolicy::Lazy);
    let status = session.status();

    for _ in 0..3 {
        assert!(status.can_connect());
        session.connect().unwrap();
        assert!(status.can_flash());
        session.disconnect();
    }

    assert_eq!(recorder.count("port.close"), 3);
    assert_eq!(recorder.count("transport#3.new"), 1);
}

#[test]
fn dropping_a_connected_session_releases_in_order() {
    let (mut session, recorder) = common::session(ConnectionPolicy::Eager);
    session.connect().unwrap();
    let status = session.status();
    recorder.clear();

    drop(session);

    assert_eq!(
        recorder.calls(),
        vec!["loader#1.drop", "transport#1.disconnect", "port.close"]
    );
    assert_eq!(status.state(), SessionState::Disconnected);
}

#[test]
fn dropping_a_released_session_touches_nothing() {
    let (mut session, recorder) = common::session(ConnectionPolicy::Lazy);
    session.connect().unwrap();
    session.disconnect();
    recorder.clear();

    drop(session);

    assert!(recorder.calls().is_empty());
}
