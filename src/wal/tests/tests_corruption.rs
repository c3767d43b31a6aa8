#[cfg(test)]
mod tests {
    use crate::wal::{Wal, WalError, WalRecord};
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn record(seed: f32) -> WalRecord {
        WalRecord::Insert {
            vector: vec![seed, seed * 2.0],
            metadata: Vec::new(),
        }
    }

    fn write_records(path: &std::path::Path, n: usize) -> Wal<WalRecord> {
        let wal = Wal::open(path, None).unwrap();
        for i in 0..n {
            wal.append(&record(i as f32)).unwrap();
        }
        wal
    }

    #[test]
    fn test_corrupted_record_payload_detected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad_payload.wal");
        let wal = write_records(&path, 1);

        // Flip bytes inside the first record's payload (after the 4-byte
        // length prefix).
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        f.seek(SeekFrom::Start(6)).unwrap();
        f.write_all(&[0xFF, 0x00, 0xEE]).unwrap();
        f.sync_all().unwrap();

        let err = wal
            .replay_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap_err();
        assert!(matches!(err, WalError::ChecksumMismatch));
        assert!(err.is_torn_tail());
    }

    #[test]
    fn test_forged_length_prefix_detected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad_len.wal");
        let wal = write_records(&path, 1);

        // Overwrite the length prefix with an absurd value.
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
        f.sync_all().unwrap();

        let err = wal
            .replay_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap_err();
        assert!(matches!(err, WalError::RecordTooLarge(_)));
    }

    #[test]
    fn test_torn_final_record_replays_prefix() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("torn.wal");
        let wal = write_records(&path, 3);

        // Chop off the last few bytes, simulating a crash mid-append.
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        let len = f.metadata().unwrap().len();
        f.set_len(len - 3).unwrap();
        f.sync_all().unwrap();

        let mut replayed = Vec::new();
        for result in wal.replay_iter() {
            match result {
                Ok(r) => replayed.push(r),
                Err(e) if e.is_torn_tail() => break,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert_eq!(replayed.len(), 2, "only intact records should replay");
        assert_eq!(replayed[0], record(0.0));
        assert_eq!(replayed[1], record(1.0));
    }

    #[test]
    fn test_corrupted_checksum_stops_replay_at_that_record() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad_crc.wal");
        let wal = write_records(&path, 3);

        // Corrupt the trailing checksum bytes of the last record.
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        f.seek(SeekFrom::End(-2)).unwrap();
        f.write_all(&[0x99, 0x77]).unwrap();
        f.sync_all().unwrap();

        let mut replayed = Vec::new();
        let mut torn = false;
        for result in wal.replay_iter() {
            match result {
                Ok(r) => replayed.push(r),
                Err(WalError::ChecksumMismatch) => {
                    torn = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert!(torn);
        assert_eq!(replayed.len(), 2);
    }

    #[test]
    fn test_io_error_is_not_classified_as_torn_tail() {
        let err = WalError::Io(std::io::Error::other("disk gone"));
        assert!(!err.is_torn_tail());
    }

    #[test]
    fn test_iterator_offset_marks_valid_prefix() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("prefix.wal");
        let wal = write_records(&path, 2);
        let intact_len = wal.file_size().unwrap();

        // Append a third record, then tear it.
        wal.append(&record(2.0)).unwrap();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(wal.file_size().unwrap() - 2).unwrap();
        f.sync_all().unwrap();

        let mut iter = wal.replay_iter();
        let mut ok = 0;
        while let Some(result) = iter.next() {
            match result {
                Ok(_) => ok += 1,
                Err(e) if e.is_torn_tail() => break,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert_eq!(ok, 2);
        assert_eq!(iter.offset(), intact_len);

        // Truncating to the prefix makes the log clean again.
        wal.truncate_to(iter.offset()).unwrap();
        let replayed: Vec<WalRecord> = wal.replay_iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(wal.file_size().unwrap(), intact_len);
    }
}
