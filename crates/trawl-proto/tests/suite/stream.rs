use anyhow::Result;
use proptest::prelude::*;
use trawl_proto::{
    encode_frame, read_all, ChunkMatch, DecodeError, DoneEvent, EventWriter, FileMatch,
    FrameHandler, Location, Range,
};

#[derive(Default)]
struct Collect {
    batches: Vec<Vec<FileMatch>>,
    done: Option<DoneEvent>,
    unknown: Vec<(String, String)>,
}

impl FrameHandler for Collect {
    type Error = DecodeError;

    fn on_matches(&mut self, matches: Vec<FileMatch>) -> Result<(), DecodeError> {
        self.batches.push(matches);
        Ok(())
    }

    fn on_done(&mut self, done: DoneEvent) -> Result<(), DecodeError> {
        self.done = Some(done);
        Ok(())
    }

    fn on_unknown(&mut self, event: &str, data: &str) -> Result<(), DecodeError> {
        self.unknown.push((event.to_owned(), data.to_owned()));
        Ok(())
    }
}

fn file_match(path: &str, line: u32) -> FileMatch {
    let start = Location {
        offset: line * 10,
        line,
        column: 0,
    };
    FileMatch {
        path: path.to_owned(),
        chunk_matches: vec![ChunkMatch {
            content: "fn main() {}".to_owned(),
            content_start: start,
            ranges: vec![Range {
                start,
                end: Location {
                    column: 2,
                    offset: start.offset + 2,
                    ..start
                },
            }],
        }],
        limit_hit: false,
    }
}

#[tokio::test]
async fn writer_output_decodes_and_trailing_bytes_are_ignored() -> Result<()> {
    let mut writer = EventWriter::new(Vec::new());
    writer.write_matches(&[file_match("a.rs", 1)]).await?;
    writer.write_event("progress", &serde_json::json!({"searched": 3})).await?;
    writer
        .write_matches(&[file_match("b.rs", 2), file_match("c.rs", 3)])
        .await?;
    writer
        .write_done(&DoneEvent {
            limit_hit: true,
            ..Default::default()
        })
        .await?;
    assert!(writer.write_matches(&[]).await.is_err());

    let mut bytes = writer.into_inner();
    bytes.extend_from_slice(b"garbage that is never parsed {{{");

    let mut collect = Collect::default();
    read_all(bytes.as_slice(), &mut collect).await?;

    assert_eq!(collect.batches.len(), 2);
    assert_eq!(collect.batches[1][1].path, "c.rs");
    assert_eq!(collect.unknown, vec![("progress".to_owned(), r#"{"searched":3}"#.to_owned())]);
    assert!(collect.done.expect("done frame").limit_hit);
    Ok(())
}

#[tokio::test]
async fn handler_error_stops_decoding() {
    struct FailOnUnknown;

    impl FrameHandler for FailOnUnknown {
        type Error = DecodeError;

        fn on_matches(&mut self, _: Vec<FileMatch>) -> Result<(), DecodeError> {
            Ok(())
        }

        fn on_done(&mut self, _: DoneEvent) -> Result<(), DecodeError> {
            panic!("done must not be reached");
        }

        fn on_unknown(&mut self, event: &str, _: &str) -> Result<(), DecodeError> {
            Err(DecodeError::Malformed(format!("unexpected {event}")))
        }
    }

    let mut input = encode_frame("surprise", &1).unwrap();
    input.extend(encode_frame("done", &DoneEvent::default()).unwrap());
    let err = read_all(input.as_slice(), &mut FailOnUnknown).await.unwrap_err();
    assert!(err.to_string().contains("surprise"));
}

proptest! {
    #[test]
    fn n_batches_then_done_round_trip(batch_sizes in prop::collection::vec(0usize..4, 0..8), trailing in prop::collection::vec(any::<u8>(), 0..64)) {
        let batches: Vec<Vec<FileMatch>> = batch_sizes
            .iter()
            .enumerate()
            .map(|(i, size)| (0..*size).map(|j| file_match(&format!("f{i}_{j}.rs"), j as u32)).collect())
            .collect();

        let mut input = Vec::new();
        for batch in &batches {
            input.extend(encode_frame("matches", batch).unwrap());
        }
        input.extend(encode_frame("done", &DoneEvent::default()).unwrap());
        input.extend(trailing);

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let mut collect = Collect::default();
        runtime.block_on(read_all(input.as_slice(), &mut collect)).unwrap();
        prop_assert_eq!(collect.batches, batches);
        prop_assert!(collect.done.is_some());
    }
}
