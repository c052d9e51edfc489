//! Property tests: readers must not care how the network splits the bytes.

use proptest::prelude::*;

use imengine::peer::stream::{message_stanza, stream_open, StreamEvent, StreamParser, STREAM_CLOSE};
use imengine::protocol::{Command, CommandGrammar, FrameReader, PayloadRule};

fn grammar() -> CommandGrammar {
    CommandGrammar::new()
        .with_payload("MSG", PayloadRule::LastParam)
        .with_untracked("MSG")
        .with_payload("NOT", PayloadRule::Param(0))
        .with_untracked("NOT")
}

fn wire() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"VER 1 MSNP8 CVR0\r\n");
    let body = b"MIME-Version: 1.0\r\nContent-Type: text/x-msmsgsprofile\r\nkv: 1\r\n\r\n";
    out.extend_from_slice(format!("MSG Hotmail Hotmail {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(b"ILN 6 NLN bob@example.com Bob\r\n");
    out.extend_from_slice(b"NOT 12\r\n<notify id/>");
    out.extend_from_slice(b"ADD 5 208\r\n");
    out.extend_from_slice(b"MSG bob@example.com Bob 0\r\n");
    out.extend_from_slice(b"OUT OTH\r\n");
    out
}

fn read_all(chunks: &[&[u8]]) -> Vec<Command> {
    let grammar = grammar();
    let mut reader = FrameReader::new();
    let mut out = Vec::new();
    for chunk in chunks {
        reader.push(chunk);
        while let Some(cmd) = reader.next_command(&grammar) {
            out.push(cmd.unwrap());
        }
    }
    assert!(reader.finish().is_ok());
    out
}

/// Cut `data` at the given (unsorted, possibly repeated) offsets.
fn split<'a>(data: &'a [u8], cuts: &[usize]) -> Vec<&'a [u8]> {
    let mut cuts: Vec<usize> = cuts.iter().map(|c| c % (data.len() + 1)).collect();
    cuts.sort_unstable();
    let mut chunks = Vec::new();
    let mut start = 0;
    for cut in cuts {
        chunks.push(&data[start..cut]);
        start = cut;
    }
    chunks.push(&data[start..]);
    chunks
}

fn peer_wire() -> Vec<u8> {
    let mut out = stream_open("bob@desk", Some("alice@laptop")).into_bytes();
    out.extend_from_slice(message_stanza("bob@desk", "alice@laptop", "one & two").as_bytes());
    out.extend_from_slice(message_stanza("bob@desk", "alice@laptop", "<three>").as_bytes());
    out.extend_from_slice(STREAM_CLOSE.as_bytes());
    out
}

fn parse_all(chunks: &[&[u8]]) -> Vec<StreamEvent> {
    let mut parser = StreamParser::new();
    let mut out = Vec::new();
    for chunk in chunks {
        parser.push(chunk);
        while let Some(event) = parser.next_event().unwrap() {
            out.push(event);
        }
    }
    out
}

#[test]
fn whole_wire_parses() {
    let commands = read_all(&[&wire()]);
    let verbs: Vec<&str> = commands.iter().map(Command::verb).collect();
    assert_eq!(verbs, ["VER", "MSG", "ILN", "NOT", "ADD", "MSG", "OUT"]);
    assert_eq!(commands[5].payload().map(|p| p.len()), Some(0));
}

proptest! {
    #[test]
    fn commands_survive_any_split(cuts in prop::collection::vec(any::<usize>(), 0..12)) {
        let data = wire();
        let expected = read_all(&[&data]);
        let chunks = split(&data, &cuts);
        prop_assert_eq!(read_all(&chunks), expected);
    }

    #[test]
    fn byte_at_a_time(skip in 0usize..8) {
        let data = wire();
        let chunks: Vec<&[u8]> = data[skip..].chunks(1).collect();
        let mut all = vec![&data[..skip]];
        all.extend(chunks);
        prop_assert_eq!(read_all(&all), read_all(&[&data]));
    }

    #[test]
    fn stream_events_survive_any_split(cuts in prop::collection::vec(any::<usize>(), 0..12)) {
        let data = peer_wire();
        let expected = parse_all(&[&data]);
        prop_assert_eq!(expected.len(), 4);
        let chunks = split(&data, &cuts);
        prop_assert_eq!(parse_all(&chunks), expected);
    }
}
