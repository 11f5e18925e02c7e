mod common;

use apm::stack::ThreadRegistry;
use apm::Application;
use apm_common::{Configuration, Connector};
use common::{settings, FakeConnector};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Delays = Arc<Mutex<Vec<Duration>>>;

fn app_failing(failures: usize) -> (Arc<Application>, Arc<FakeConnector>, Delays) {
    let connector = Arc::new(FakeConnector::failing(Configuration::default(), failures));
    let shared: Arc<dyn Connector> = Arc::clone(&connector) as _;
    let delays = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&delays);
    let app = Arc::new(
        Application::new(settings(), shared, ThreadRegistry::new())
            .with_sleeper(move |delay| recorded.lock().unwrap().push(delay)),
    );
    (app, connector, delays)
}

#[test]
fn test_registration_backs_off_then_caps() {
    let (app, connector, delays) = app_failing(7);
    app.activate_session();
    assert!(app.wait_for_session_activation(Duration::from_secs(5)));

    let secs: Vec<u64> = delays.lock().unwrap().iter().map(Duration::as_secs).collect();
    assert_eq!(secs, [15, 15, 30, 60, 120, 300, 300]);
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 8);
    assert_eq!(app.configuration().unwrap().agent_run_id, 8);
}

#[test]
fn test_immediate_registration_never_sleeps() {
    let (app, connector, delays) = app_failing(0);
    app.activate_session();
    assert!(app.wait_for_session_activation(Duration::from_secs(5)));

    assert!(delays.lock().unwrap().is_empty());
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_activation_is_single_flight() {
    let (app, connector, _delays) = app_failing(0);
    for _ in 0..10 {
        app.activate_session();
    }
    assert!(app.wait_for_session_activation(Duration::from_secs(5)));

    // Activating while connected does nothing
    app.activate_session();
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_wait_times_out_while_disconnected() {
    let (app, _connector, _delays) = app_failing(0);
    assert!(!app.wait_for_session_activation(Duration::from_millis(10)));
    assert!(!app.is_connected());
}

#[test]
fn test_recording_before_connection_is_dropped() {
    let (app, _connector, _delays) = app_failing(0);
    app.record_transaction(&common::transaction("early"));
    app.record_metric("Custom/Early", 1.0);
    app.record_metrics([("Custom/Early/a", 1.0), ("Custom/Early/b", 2.0)]);
    assert_eq!(app.transaction_count(), 0);

    app.activate_session();
    assert!(app.wait_for_session_activation(Duration::from_secs(5)));
    assert_eq!(app.transaction_count(), 0);
}

#[test]
fn test_connect_directly_on_caller_thread() {
    let (app, connector, delays) = app_failing(2);
    app.connect_to_data_collector();

    assert!(app.is_connected());
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(delays.lock().unwrap().len(), 2);

    // Returns at once when a session already exists
    app.connect_to_data_collector();
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
}
