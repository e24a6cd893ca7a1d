//! Session lifecycle tests against the simulated board

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use pterodaq_core::board::model_response;
    use pterodaq_core::config::{AcquisitionPlan, ChannelSpec, ConnectionConfig};
    use pterodaq_core::datalog::read_recording;
    use pterodaq_core::protocol::{Command, DeviceErrorKind, PayloadBuilder, TelemetryFrame};
    use pterodaq_core::session::{
        AcquisitionConfig, ChannelDescriptor, ConnectError, Interpretation, SampleValue, Session,
        SessionError, SessionState, TriggerSpec, TRIGGER_OVERRUN_MESSAGE,
    };
    use pterodaq_core::sim::SimulatedBoard;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    /// PTB0 on the KL25Z
    const ANALOG_PROBE: u16 = 0x0801;

    fn settings(attempts: u32) -> ConnectionConfig {
        ConnectionConfig {
            command_timeout_ms: 300,
            read_timeout_ms: 10,
            frame_timeout_ms: 100,
            command_attempts: attempts,
            reset_on_open: false,
            ..ConnectionConfig::default()
        }
    }

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("pterodaq_core=debug")
            .try_init();
    }

    fn connected() -> (SimulatedBoard, Session) {
        init_logging();
        let (board, host) = SimulatedBoard::kl25z().unwrap();
        let mut session = Session::new(settings(1));
        session.connect(Box::new(host)).unwrap();
        (board, session)
    }

    fn analog_config(period: f64, channels: usize) -> AcquisitionConfig {
        AcquisitionConfig::new(
            TriggerSpec::timed(period),
            "Power",
            None,
            (0..channels)
                .map(|i| {
                    ChannelDescriptor::new(format!("a{}", i), ANALOG_PROBE, Interpretation::analog())
                })
                .collect(),
        )
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_connect_identifies_board() {
        let (board, session) = connected();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.is_connected());
        assert_eq!(session.version(), Some("v0.2"));
        assert_eq!(session.profile().map(|p| p.name()), Some("FRDM-KL25Z"));
        assert_eq!(board.received(), b"HVM".to_vec());
    }

    #[test]
    fn test_wrong_handshake_reply() {
        let (board, host) = SimulatedBoard::kl25z().unwrap();
        board.set_handshake_reply(b"DAQX");
        let mut session = Session::new(settings(3));
        match session.connect(Box::new(host)) {
            Err(ConnectError::HandshakeFailed { got }) => assert_eq!(got, "DAQX"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_connected());
        assert_eq!(board.received(), vec![b'H']);
    }

    #[test]
    fn test_handshake_timeout_after_retries() {
        let (board, host) = SimulatedBoard::kl25z().unwrap();
        board.drop_responses(Command::Handshake, 3);
        let mut session = Session::new(settings(1));
        assert!(matches!(
            session.connect(Box::new(host)),
            Err(ConnectError::HandshakeTimeout)
        ));
        assert_eq!(board.command_count(Command::Handshake), 3);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_handshake_retry_recovers() {
        let (board, host) = SimulatedBoard::kl25z().unwrap();
        board.drop_responses(Command::Handshake, 2);
        // handshake retries do not follow the runtime retry setting
        let mut session = Session::new(settings(1));
        session.connect(Box::new(host)).unwrap();
        assert_eq!(board.command_count(Command::Handshake), 3);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_unknown_model_rejected() {
        let (board, host) = SimulatedBoard::kl25z().unwrap();
        board.set_model(model_response(9, 19859, None));
        let mut session = Session::new(settings(1));
        assert!(matches!(
            session.connect(Box::new(host)),
            Err(ConnectError::UnknownModel(9))
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_connected());
        assert!(session.profile().is_none());
        assert_eq!(board.received(), b"HVM".to_vec());
        assert!(matches!(session.start(), Err(SessionError::NotConnected)));
    }

    #[test]
    fn test_version_mismatch() {
        let (board, host) = SimulatedBoard::kl25z().unwrap();
        board.set_version(b"v0.1");
        let mut session = Session::new(settings(1));
        match session.connect(Box::new(host)) {
            Err(ConnectError::VersionMismatch { got, want }) => {
                assert_eq!(got, "v0.1");
                assert_eq!(want, "v0.2");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!session.is_connected());
    }

    #[test]
    fn test_connect_in_background() {
        let (_board, host) = SimulatedBoard::kl25z().unwrap();
        let (tx, rx) = mpsc::channel();
        let handle = Session::new(settings(1))
            .connect_in_background(Box::new(host), move |result| {
                let _ = tx.send(result.is_ok());
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        let session = handle.join().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_second_connect_rejected() {
        let (_board, mut session) = connected();
        let (_other, host) = SimulatedBoard::kl25z().unwrap();
        assert!(matches!(
            session.connect(Box::new(host)),
            Err(ConnectError::AlreadyConnected)
        ));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_start_requires_configuration() {
        let (_board, mut session) = connected();
        assert!(matches!(session.start(), Err(SessionError::NotConfigured)));
        assert!(matches!(session.single_trigger(), Err(SessionError::NotConfigured)));
        assert!(matches!(
            session.configure(analog_config(0.1, 0)),
            Err(SessionError::EmptyChannelList)
        ));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_timed_run_records_rows() {
        let (board, mut session) = connected();
        board.set_analog(ANALOG_PROBE, 1000);
        session.configure(analog_config(0.01, 1)).unwrap();
        assert_eq!(session.state(), SessionState::Configured);
        let actual = session.actual_period().unwrap();
        assert!((actual - 0.01).abs() < 1e-6);
        assert_eq!(board.config().map(|c| c.probes), Some(vec![ANALOG_PROBE]));

        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert!(matches!(
            session.configure(analog_config(0.01, 1)),
            Err(SessionError::Running)
        ));
        assert!(matches!(session.start(), Err(SessionError::InvalidState { .. })));
        assert!(wait_until(|| session.row_count() >= 5));
        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Configured);
        assert!(!board.is_sampling());

        // everything the board sent before stopping is decoded
        let rows = session.rows();
        assert_eq!(rows.len() as u64, board.frames_sent());
        for (i, row) in rows.iter().enumerate() {
            assert!((row.time - i as f64 * 0.01).abs() < 1e-9);
            assert_eq!(row.values, vec![SampleValue::Analog(1000)]);
        }
        assert_eq!(session.dropped_packets(), 0);
        assert_eq!(session.unsaved_count(), rows.len());
    }

    #[test]
    fn test_stop_refreshes_supply_voltage() {
        let (board, mut session) = connected();
        let before = session.profile().unwrap().power_voltage();
        // a lower bandgap reading means a higher supply
        board.set_model(model_response(5, 18000, None));
        session.stop().unwrap();
        let after = session.profile().unwrap().power_voltage();
        assert!(after > before);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_configure_clears_only_on_channel_count_change() {
        let (_board, mut session) = connected();
        session.configure(analog_config(0.1, 1)).unwrap();
        session.single_trigger().unwrap();
        session.single_trigger().unwrap();
        assert!(wait_until(|| session.row_count() == 2));

        session.configure(analog_config(0.2, 1)).unwrap();
        assert_eq!(session.row_count(), 2);

        session.configure(analog_config(0.2, 2)).unwrap();
        assert_eq!(session.row_count(), 0);
    }

    #[test]
    fn test_failed_configure_keeps_previous_layout() {
        let (board, mut session) = connected();
        board.set_analog(ANALOG_PROBE, 500);
        session.configure(analog_config(0.1, 1)).unwrap();
        session.single_trigger().unwrap();
        session.single_trigger().unwrap();
        assert!(wait_until(|| session.row_count() == 2));

        board.drop_responses(Command::Configure, 1);
        assert!(matches!(
            session.configure(analog_config(0.05, 2)),
            Err(SessionError::CommandFailed {
                command: Command::Configure,
                attempts: 1
            })
        ));
        assert_eq!(session.row_count(), 2);
        assert_eq!(session.state(), SessionState::Configured);
        assert_eq!(session.config().map(|c| c.channels.len()), Some(1));
        assert_eq!(board.config().map(|c| c.probes), Some(vec![ANALOG_PROBE]));
        let actual = session.actual_period().unwrap();
        assert!((actual - 0.1).abs() < 1e-6);

        // the board still runs the old layout, so its frames decode
        session.start().unwrap();
        assert!(wait_until(|| session.row_count() >= 4));
        session.stop().unwrap();
        assert_eq!(session.rows()[3].values, vec![SampleValue::Analog(500)]);
    }

    #[test]
    fn test_failed_configure_from_idle_stays_idle() {
        let (board, mut session) = connected();
        board.drop_responses(Command::Configure, 1);
        assert!(session.configure(analog_config(0.1, 1)).is_err());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.config().is_none());
        assert!(session.actual_period().is_none());
        assert!(matches!(session.start(), Err(SessionError::NotConfigured)));
    }

    #[test]
    fn test_clear_drops_rows() {
        let (_board, mut session) = connected();
        session.configure(analog_config(0.1, 1)).unwrap();
        session.single_trigger().unwrap();
        assert!(wait_until(|| session.row_count() == 1));
        session.clear().unwrap();
        assert_eq!(session.row_count(), 0);
        assert_eq!(session.unsaved_count(), 0);
    }

    #[test]
    fn test_dropped_packets_counted() {
        let (board, mut session) = connected();
        session.configure(analog_config(0.1, 1)).unwrap();
        session.start().unwrap();
        assert!(wait_until(|| session.row_count() >= 1));
        session.stop().unwrap();
        let recorded = session.row_count() as u32;
        assert_eq!(session.dropped_packets(), 0);

        // two frames arrive with gaps before each
        for count in [recorded + 2, recorded + 5] {
            let payload = PayloadBuilder::new().u32_le(count).u16_le(0).build();
            board.inject_raw(&TelemetryFrame::new(payload).unwrap().to_bytes());
        }
        assert!(wait_until(|| session.row_count() as u32 == recorded + 2));
        assert_eq!(session.dropped_packets(), 4);
    }

    #[test]
    fn test_single_trigger_keeps_drop_baseline() {
        let (_board, mut session) = connected();
        session.configure(analog_config(0.05, 1)).unwrap();
        session.start().unwrap();
        assert!(wait_until(|| session.row_count() >= 3));
        session.stop().unwrap();
        let recorded = session.row_count();
        assert_eq!(session.dropped_packets(), 0);

        // single reads continue the board's trigger count
        for _ in 0..3 {
            session.single_trigger().unwrap();
        }
        assert!(wait_until(|| session.row_count() == recorded + 3));
        assert_eq!(session.dropped_packets(), 0);
        let last = session.rows().last().map(|r| r.time).unwrap();
        assert!((last - (recorded + 2) as f64 * 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_command_retried_after_timeout() {
        let (board, host) = SimulatedBoard::kl25z().unwrap();
        let mut session = Session::new(settings(3));
        session.connect(Box::new(host)).unwrap();
        session.configure(analog_config(0.1, 1)).unwrap();

        board.drop_responses(Command::Go, 1);
        session.start().unwrap();
        assert_eq!(board.command_count(Command::Go), 2);
        session.stop().unwrap();
    }

    #[test]
    fn test_command_failure_reported() {
        let (board, mut session) = connected();
        session.configure(analog_config(0.1, 1)).unwrap();
        board.drop_responses(Command::Go, 1);
        assert!(matches!(
            session.start(),
            Err(SessionError::CommandFailed {
                command: Command::Go,
                attempts: 1
            })
        ));
        assert_eq!(session.state(), SessionState::Configured);
    }

    #[test]
    fn test_edge_triggered_run() {
        let (board, mut session) = connected();
        board.set_analog(ANALOG_PROBE, 42);
        let config = AcquisitionConfig::new(
            TriggerSpec::edge("PTD4", "rises"),
            "Power",
            None,
            vec![ChannelDescriptor::new("a", ANALOG_PROBE, Interpretation::analog())],
        );
        session.configure(config).unwrap();
        assert_eq!(session.actual_period(), None);
        session.start().unwrap();
        assert!(wait_until(|| board.is_sampling()));

        for _ in 0..3 {
            thread::sleep(Duration::from_millis(20));
            board.pulse();
        }
        assert!(wait_until(|| session.row_count() == 3));
        session.stop().unwrap();

        let rows = session.rows();
        assert!(rows.windows(2).all(|pair| pair[1].time > pair[0].time));
        assert!(rows.iter().all(|r| r.values == vec![SampleValue::Analog(42)]));
        // no timed period, nothing to count as dropped
        assert_eq!(session.dropped_packets(), 0);
    }

    #[test]
    fn test_illegal_trigger_latches() {
        let (board, mut session) = connected();
        session.configure(analog_config(0.1, 1)).unwrap();
        board.send_error(DeviceErrorKind::IllegalTriggerType(9));
        assert!(wait_until(|| session.device_fault() == Some(9)));

        assert!(matches!(session.start(), Err(SessionError::IllegalTriggerType(9))));
        assert!(matches!(
            session.configure(analog_config(0.1, 1)),
            Err(SessionError::IllegalTriggerType(9))
        ));
        assert!(matches!(session.stop(), Err(SessionError::IllegalTriggerType(9))));
        assert_eq!(board.command_count(Command::Go), 0);
    }

    #[test]
    fn test_trigger_overrun_cleared_on_start() {
        let (board, mut session) = connected();
        session.configure(analog_config(0.1, 1)).unwrap();
        board.send_error(DeviceErrorKind::TriggerOverrun);
        assert!(wait_until(|| session.trigger_error().is_some()));
        assert_eq!(
            session.trigger_error().as_deref(),
            Some(TRIGGER_OVERRUN_MESSAGE)
        );

        session.start().unwrap();
        assert_eq!(session.trigger_error(), None);
        session.stop().unwrap();
    }

    #[test]
    fn test_lost_link_leaves_session_disconnected() {
        let (board, mut session) = connected();
        drop(board);
        assert!(wait_until(|| session.state() == SessionState::Disconnected));
        assert!(session.link_lost().is_some());
        assert!(!session.is_connected());
        assert!(matches!(session.start(), Err(SessionError::NotConnected)));

        let (_board, host) = SimulatedBoard::kl25z().unwrap();
        assert!(matches!(
            session.connect(Box::new(host)),
            Err(ConnectError::AlreadyConnected)
        ));

        session.disconnect();
        let (_board, host) = SimulatedBoard::kl25z().unwrap();
        session.connect(Box::new(host)).unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.link_lost(), None);
    }

    #[test]
    fn test_save_and_read_back() {
        let (board, mut session) = connected();
        let plan = AcquisitionPlan {
            trigger: TriggerSpec::timed(0.1),
            reference: "Power".into(),
            averaging: None,
            channels: vec![
                ChannelSpec {
                    name: Some("light".into()),
                    ..ChannelSpec::pin("PTB0")
                },
                ChannelSpec::pin("PTA1"),
            ],
        };
        session.configure_plan(&plan).unwrap();
        let config = session.config().unwrap();
        board.set_analog(config.channels[0].probe, 32768);
        board.set_digital(config.channels[1].probe, true);

        session.single_trigger().unwrap();
        session.single_trigger().unwrap();
        assert!(wait_until(|| session.row_count() == 2));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.txt");
        session.save(&path, "bench test", true, None).unwrap();
        assert_eq!(session.unsaved_count(), 0);

        let recording = read_recording(&path).unwrap();
        assert_eq!(recording.channels, vec!["light".to_string(), "PTA1".to_string()]);
        assert_eq!(recording.len(), 2);
        assert!(recording.header.iter().any(|line| line.contains("bench test")));

        let half_supply = session.profile().unwrap().power_voltage() / 2.0;
        let rows: Vec<_> = recording.rows().collect();
        assert!((rows[1].elapsed - 0.1).abs() < 1e-6);
        for row in rows {
            assert!((row.values[0] - half_supply).abs() < 1e-5);
            assert_eq!(row.values[1], 1.0);
        }
    }
}
