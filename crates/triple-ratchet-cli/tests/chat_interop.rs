#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! The chat REPL speaks the same hex line format a library caller would
//! produce by hand.

use triple_ratchet::{SessionConfig, TripleSession, session_pair};
use triple_ratchet_cli::chat::{Chat, Command, parse_command};

fn recv_line(ciphertext: &[u8], header: &[u8]) -> String {
    format!("recv {} {}", hex::encode(ciphertext), hex::encode(header))
}

#[test]
fn recv_lines_carry_exact_bytes() {
    let (mut alice, mut bob) = session_pair();
    let (ct, header) = alice.encrypt(b"over the wire", true).unwrap();

    let Some(Command::Recv {
        ciphertext,
        header: parsed_header,
    }) = parse_command(&recv_line(&ct, &header)).unwrap()
    else {
        panic!("expected a recv command");
    };
    assert_eq!(ciphertext, ct);
    assert_eq!(parsed_header, header);
    assert_eq!(bob.decrypt(&ciphertext, &parsed_header).unwrap(), b"over the wire");
}

#[test]
fn chat_talks_to_a_library_session() {
    let mut chat = Chat::new("alice", SessionConfig::default(), None, false).unwrap();
    let mut bob = TripleSession::new(None, Some(&chat.session().macro_pk())).unwrap();
    chat.execute(Command::Peer(bob.macro_pk().to_vec())).unwrap();

    let line = chat
        .execute(Command::Rotate("hello bob".into()))
        .unwrap()
        .unwrap();
    let Some(Command::Recv { ciphertext, header }) = parse_command(&line).unwrap() else {
        panic!("chat did not print a recv line: {line}");
    };
    assert_eq!(bob.decrypt(&ciphertext, &header).unwrap(), b"hello bob");
    assert_eq!(bob.epoch(), 1);

    let (ct, header) = bob.encrypt(b"hello alice", false).unwrap();
    let reply = chat
        .execute(parse_command(&recv_line(&ct, &header)).unwrap().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(reply, "[epoch 1] hello alice");
}

#[test]
fn scripted_session_over_stdin() {
    let mut chat = Chat::new("alice", SessionConfig::default(), None, false).unwrap();
    let mut bob = TripleSession::new(None, Some(&chat.session().macro_pk())).unwrap();
    let (ct, header) = {
        let mut scratch = TripleSession::new(None, None).unwrap();
        scratch.set_peer_macro_pk(&bob.macro_pk()).unwrap();
        scratch.encrypt(b"from a stranger", false).unwrap()
    };

    let script = format!(
        "peer {}\n{}\nsend still here\nstatus\n",
        hex::encode(bob.macro_pk()),
        recv_line(&ct, &header)
    );
    let mut output = Vec::new();
    chat.run(script.as_bytes(), &mut output).unwrap();
    let output = String::from_utf8(output).unwrap();

    // The stranger's message fails; the session carries on unchanged.
    assert!(output.contains("error: "), "{output}");
    assert!(output.contains("epoch 0, anchored true"), "{output}");

    let line = output
        .lines()
        .find(|l| l.starts_with("recv "))
        .unwrap();
    let Some(Command::Recv { ciphertext, header }) = parse_command(line).unwrap() else {
        panic!("expected a recv line");
    };
    assert_eq!(bob.decrypt(&ciphertext, &header).unwrap(), b"still here");
}
