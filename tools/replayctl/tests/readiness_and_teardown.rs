use replayctl::errors::ReplayError;
use replayctl::readiness::{poll_until_ready, PollPolicy, ReadinessProbe};
use replayctl::runtime::{
    Clock, FakeClock, FakeHttpClient, FakeProcessRunner, ProcessRequest, ProcessRunner, Signal,
};
use replayctl::teardown::terminate_group;
use std::time::Duration;

fn probe() -> ReadinessProbe {
    ReadinessProbe {
        method: "POST".to_string(),
        url: "http://localhost:8090/post?name=hello".to_string(),
    }
}

#[test]
fn dead_endpoint_times_out_within_deadline_plus_interval() {
    let policy = PollPolicy {
        timeout: Duration::from_secs(30),
        interval: Duration::from_millis(500),
        attempt_timeout: Duration::from_secs(3),
    };
    for attempt_cost in [
        Duration::ZERO,
        Duration::from_millis(20),
        Duration::from_secs(60),
    ] {
        let clock = FakeClock::default();
        let start = clock.now();
        let http = FakeHttpClient::with_clock(clock.clone(), attempt_cost);

        let err = poll_until_ready(&http, &clock, &probe(), &policy).expect_err("never ready");

        let elapsed = clock.now().duration_since(start).expect("monotonic");
        assert!(
            elapsed <= policy.timeout + policy.interval,
            "cost {attempt_cost:?} took {elapsed:?}"
        );
        match err {
            ReplayError::ReadinessTimeout {
                url, last_error, ..
            } => {
                assert_eq!(url, probe().url);
                assert!(last_error.contains("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!http.requests().is_empty());
    }
}

#[test]
fn hanging_attempts_never_exceed_the_time_left() {
    let clock = FakeClock::default();
    let start = clock.now();
    let http = FakeHttpClient::with_clock(clock.clone(), Duration::from_secs(3600));
    let policy = PollPolicy {
        timeout: Duration::from_secs(10),
        interval: Duration::from_millis(500),
        attempt_timeout: Duration::from_secs(3),
    };

    let _ = poll_until_ready(&http, &clock, &probe(), &policy);

    let mut left = policy.timeout;
    for request in http.requests() {
        assert!(request.timeout <= left);
        left = left.saturating_sub(request.timeout + policy.interval);
    }
    assert!(clock.now().duration_since(start).expect("monotonic") <= policy.timeout);
}

#[test]
fn teardown_twice_on_a_terminated_group_is_quiet() {
    let runner = FakeProcessRunner::default();
    let clock = FakeClock::default();
    let mut request = ProcessRequest::new("mitmredis");
    request.own_process_group = true;
    let handle = runner.spawn(request).expect("spawn");

    let first = terminate_group(&runner, &clock, &handle, Duration::from_secs(5));
    let second = terminate_group(&runner, &clock, &handle, Duration::from_secs(5));

    assert!(first.exited());
    assert!(second.exited());
    assert!(!second.forced);
    assert!(second.errors.is_empty());
    assert!(!runner.is_running(&handle));
    assert_eq!(
        runner.signals(),
        vec![
            (handle.id, Signal::Terminate),
            (handle.id, Signal::Kill),
            (handle.id, Signal::Terminate),
            (handle.id, Signal::Kill),
        ]
    );
}

#[cfg(unix)]
fn group_gone(pgid: libc::pid_t) -> bool {
    // Orphaned members are reaped by init, which can lag a moment behind.
    (0..40).any(|_| {
        if unsafe { libc::killpg(pgid, 0) } == -1 {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
        false
    })
}

#[cfg(unix)]
#[test]
fn real_process_group_is_stopped_and_second_teardown_succeeds() {
    use replayctl::runtime::{ProductionClock, ProductionProcessRunner};

    let runner = ProductionProcessRunner::new();
    let mut request = ProcessRequest::new("/bin/sh");
    request.args = vec![
        "-c".to_string(),
        "echo booting; sleep 30 & wait".to_string(),
    ];
    request.own_process_group = true;
    let handle = runner.spawn(request).expect("spawn");
    assert_eq!(runner.try_wait(&handle).expect("try_wait"), None);

    let report = terminate_group(&runner, &ProductionClock, &handle, Duration::from_secs(5));
    assert!(report.exited());
    assert!(report.errors.is_empty());
    let again = terminate_group(&runner, &ProductionClock, &handle, Duration::from_secs(1));
    assert_eq!(again.exit_code, report.exit_code);

    let pgid = handle.pgid.expect("own group") as libc::pid_t;
    assert!(group_gone(pgid), "process group should be gone");
}

#[cfg(unix)]
#[test]
fn group_member_ignoring_term_is_killed_without_waiting_for_it() {
    use replayctl::runtime::{ProductionClock, ProductionProcessRunner};
    use std::time::Instant;

    let runner = ProductionProcessRunner::new();
    let mut request = ProcessRequest::new("/bin/sh");
    request.args = vec![
        "-c".to_string(),
        "(trap '' TERM; exec sleep 12) & exec sleep 100".to_string(),
    ];
    request.own_process_group = true;
    let handle = runner.spawn(request).expect("spawn");
    // Let the subshell install its trap before the group is signalled.
    std::thread::sleep(Duration::from_millis(300));

    let started = Instant::now();
    let report = terminate_group(&runner, &ProductionClock, &handle, Duration::from_secs(1));
    let elapsed = started.elapsed();

    assert!(report.exited());
    assert!(
        elapsed < Duration::from_secs(5),
        "teardown took {elapsed:?}"
    );
    let pgid = handle.pgid.expect("own group") as libc::pid_t;
    assert!(group_gone(pgid), "TERM-ignoring member should be gone");
}
