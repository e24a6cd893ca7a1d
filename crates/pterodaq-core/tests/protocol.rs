//! Link tests against the simulated board

#[cfg(test)]
mod tests {
    use pterodaq_core::protocol::{
        Command, DeviceErrorKind, LinkChannel, LinkError, LinkEvent, LinkOptions,
        TelemetryFrame, CommandFrame,
    };
    use pterodaq_core::sim::{PipeEnd, SimulatedBoard};
    use std::sync::mpsc::{self, Receiver};
    use std::thread;
    use std::time::Duration;

    fn options() -> LinkOptions {
        LinkOptions {
            command_timeout: Duration::from_millis(300),
            read_timeout: Duration::from_millis(10),
            frame_timeout: Duration::from_millis(100),
        }
    }

    fn open(host: PipeEnd) -> (LinkChannel, Receiver<LinkEvent>) {
        let (tx, rx) = mpsc::channel();
        let link = LinkChannel::open(Box::new(host), options(), tx).unwrap();
        (link, rx)
    }

    fn next_telemetry(rx: &Receiver<LinkEvent>) -> Vec<u8> {
        loop {
            match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
                LinkEvent::Telemetry(payload) => return payload,
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_identify_board() {
        let (_board, host) = SimulatedBoard::kl25z().unwrap();
        let (link, _rx) = open(host);
        assert_eq!(link.send_command(b'H', &[]).unwrap(), b"DAQ");
        assert_eq!(link.send_command(b'V', &[]).unwrap(), b"v0.2");
        assert_eq!(link.send_command(b'M', &[]).unwrap().len(), 4);
        assert_eq!(link.counters().responses, 3);
    }

    #[test]
    fn test_garbage_before_response_is_skipped() {
        let (board, host) = SimulatedBoard::kl25z().unwrap();
        let (link, _rx) = open(host);
        board.inject_raw(&[0x00, 0x55, 0x13]);
        assert_eq!(link.send_command(b'H', &[]).unwrap(), b"DAQ");
        assert_eq!(link.counters().framing_errors, 3);
    }

    #[test]
    fn test_corrupt_telemetry_discarded() {
        let (board, host) = SimulatedBoard::kl25z().unwrap();
        let (link, rx) = open(host);

        let mut bad = TelemetryFrame::new(vec![1, 2, 3]).unwrap().to_bytes();
        let last = bad.len() - 1;
        bad[last] ^= 0x40;
        board.inject_raw(&bad);
        board.inject_raw(&TelemetryFrame::new(vec![9, 9]).unwrap().to_bytes());

        assert_eq!(next_telemetry(&rx), vec![9, 9]);
        assert_eq!(link.counters().checksum_errors, 1);
        assert_eq!(link.counters().telemetry, 1);
    }

    #[test]
    fn test_truncated_frame_recovers() {
        let (board, host) = SimulatedBoard::kl25z().unwrap();
        let (link, _rx) = open(host);

        board.inject_raw(&[b'*', 5, 1, 2]);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(link.counters().truncated_frames, 1);
        assert_eq!(link.send_command(b'H', &[]).unwrap(), b"DAQ");
    }

    #[test]
    fn test_stale_response_discarded() {
        let (board, host) = SimulatedBoard::kl25z().unwrap();
        let (link, _rx) = open(host);

        board.inject_raw(&CommandFrame::new(b'H', b"OLD".to_vec()).unwrap().to_bytes());
        thread::sleep(Duration::from_millis(100));
        assert_eq!(link.send_command(b'H', &[]).unwrap(), b"DAQ");
    }

    #[test]
    fn test_unanswered_command_times_out() {
        let (board, host) = SimulatedBoard::kl25z().unwrap();
        let (link, _rx) = open(host);
        board.drop_responses(Command::Version, 1);
        assert!(matches!(
            link.send_command(b'V', &[]),
            Err(LinkError::Timeout { code: b'V' })
        ));
        // the next one goes through
        assert_eq!(link.send_command(b'V', &[]).unwrap(), b"v0.2");
    }

    #[test]
    fn test_device_error_event() {
        let (board, host) = SimulatedBoard::kl25z().unwrap();
        let (link, rx) = open(host);
        board.send_error(DeviceErrorKind::IllegalTriggerType(7));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            LinkEvent::DeviceError(vec![2, 7])
        );
        assert_eq!(link.counters().device_errors, 1);
    }

    #[test]
    fn test_board_going_away_closes_link() {
        let (board, host) = SimulatedBoard::kl25z().unwrap();
        let (link, rx) = open(host);
        drop(board);
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            LinkEvent::Closed(Some(_)) => {}
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!link.is_open());
        assert!(matches!(link.send_command(b'H', &[]), Err(LinkError::Closed)));
    }

    #[test]
    fn test_close_on_request() {
        let (_board, host) = SimulatedBoard::kl25z().unwrap();
        let (mut link, rx) = open(host);
        link.close();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            LinkEvent::Closed(None)
        );
    }
}
