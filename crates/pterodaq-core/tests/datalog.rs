//! Recording file tests

#[cfg(test)]
mod tests {
    use chrono::Local;
    use pretty_assertions::assert_eq;
    use pterodaq_core::datalog::{
        read_recording, save_recording, HeaderChannel, RecordingHeader, RECORDING_MAGIC,
    };
    use pterodaq_core::session::{
        ChannelDescriptor, Interpretation, SampleRow, SampleValue, TriggerSpec,
    };
    use std::fs;

    fn channels() -> Vec<ChannelDescriptor> {
        vec![
            ChannelDescriptor::new("temp", 0x0801, Interpretation::analog()),
            ChannelDescriptor::new("rpm", 0x4503, Interpretation::frequency().with_downsample(2)),
            ChannelDescriptor::new("door", 0x0102, Interpretation::digital()),
        ]
    }

    fn header(convert_to_volts: bool) -> RecordingHeader {
        RecordingHeader {
            recorded_at: Local::now(),
            board: "FRDM-KL25Z".into(),
            trigger: TriggerSpec::timed(0.5),
            reference: "Power".into(),
            averaging: "1".into(),
            power_voltage: 3.3,
            convert_to_volts,
            channels: channels()
                .iter()
                .map(|c| HeaderChannel {
                    name: c.name.clone(),
                    pin: format!("P{:04x}", c.probe),
                    downsample: c.interpretation.downsample,
                })
                .collect(),
            notes: "first line\nsecond line".into(),
        }
    }

    fn row(time: f64, raw: i32, rate: f64, door: bool) -> SampleRow {
        SampleRow::new(
            time,
            vec![
                SampleValue::Analog(raw),
                SampleValue::Frequency(rate),
                SampleValue::Digital(door),
            ],
        )
    }

    #[test]
    fn test_saved_file_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.txt");
        let rows = vec![
            row(1.0, 16384, 120.0, false),
            row(1.5, 32768, 121.5, true),
            row(2.0, 49152, 121.5, true),
        ];
        save_recording(&path, &header(true), &channels(), &rows).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(RECORDING_MAGIC));
        assert!(!text.contains("Averaging"));
        assert!(text.contains("#   rpm : P4503 downsample by 2"));
        assert!(text.contains("#   second line"));

        let recording = read_recording(&path).unwrap();
        assert_eq!(recording.channels, vec!["temp", "rpm", "door"]);
        assert_eq!(recording.segments.len(), 1);

        let elapsed: Vec<f64> = recording.rows().map(|r| r.elapsed).collect();
        assert_eq!(elapsed, vec![0.0, 0.5, 1.0]);

        let player = recording.player();
        let temp = player.channel_values("temp");
        let expected = [0.825, 1.65, 2.475];
        for (value, want) in temp.iter().zip(expected) {
            assert!((value - want).abs() < 1e-6);
        }
        assert_eq!(player.channel_values("rpm"), vec![120.0, 121.5, 121.5]);
        assert_eq!(player.channel_values("door"), vec![0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_restarted_sampling_splits_segments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restart.txt");
        let rows = vec![
            row(0.0, 1, 0.0, false),
            row(0.5, 2, 0.0, false),
            row(0.0, 3, 0.0, true),
            row(0.5, 4, 0.0, true),
            row(1.0, 5, 0.0, true),
        ];
        save_recording(&path, &header(false), &channels(), &rows).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("# Scale: 0 to 65535"));
        assert!(text.contains("\n\n0.0000000\t3\t"));

        let recording = read_recording(&path).unwrap();
        assert_eq!(recording.len(), 5);
        let sizes: Vec<usize> = recording.segments.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 3]);
        let raw: Vec<f64> = recording.rows().map(|r| r.values[0]).collect();
        assert_eq!(raw, vec![1.0, 2.0, 3.0, 4.0, 5.0]);

        let mut player = recording.player();
        player.seek_to_time(1.0);
        assert_eq!(player.current().map(|r| r.values[0]), Some(5.0));
    }

    #[test]
    fn test_rejects_malformed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.txt");
        fs::write(&path, "# PteroDAQ recording\n0.0\t1\n0.1\tabc\n").unwrap();
        let err = read_recording(&path).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert!(err.to_string().starts_with("line 3"));
    }
}
