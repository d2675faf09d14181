//! In-process Alice/Bob demo.
//!
//! Alice sends numbered messages to Bob, rotating every `rotate_every`
//! messages and optionally losing every `drop_every`-th one in transit. Bob
//! acknowledges every message he receives, so both directions are exercised.

use anyhow::{Context, Result};
use triple_ratchet::{SessionConfig, TripleSession};

/// Parameters for one demo run.
#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub messages: usize,
    /// Force a rotation on every n-th message; 0 never forces one.
    pub rotate_every: usize,
    /// Lose every n-th message; `None` delivers everything.
    pub drop_every: Option<usize>,
}

/// What happened during a demo run.
#[derive(Debug, Default)]
pub struct DemoSummary {
    pub transcript: Vec<String>,
    pub delivered: usize,
    pub dropped: usize,
    pub alice_epoch: u64,
    pub bob_epoch: u64,
}

const fn every(n: usize, i: usize) -> bool {
    n != 0 && i % n == 0
}

/// Run the demo and return its transcript.
pub fn run(config: &DemoConfig, session_config: &SessionConfig) -> Result<DemoSummary> {
    let mut alice: TripleSession =
        TripleSession::with_config(session_config.clone(), None, None)
            .context("Failed to create Alice's session")?;
    let mut bob: TripleSession =
        TripleSession::with_config(session_config.clone(), None, Some(&alice.macro_pk()))
            .context("Failed to create Bob's session")?;
    alice
        .set_peer_macro_pk(&bob.macro_pk())
        .context("Failed to give Alice Bob's macro key")?;

    let mut summary = DemoSummary::default();
    summary
        .transcript
        .push(format!("alice macro key {}", hex::encode(alice.macro_pk())));
    summary
        .transcript
        .push(format!("bob   macro key {}", hex::encode(bob.macro_pk())));

    for i in 1..=config.messages {
        let text = format!("message {i}");
        let rotate = every(config.rotate_every, i);
        let (ct, header) = alice
            .encrypt(text.as_bytes(), rotate)
            .with_context(|| format!("Alice failed to encrypt message {i}"))?;

        if config.drop_every.is_some_and(|d| every(d, i)) {
            summary.dropped += 1;
            summary.transcript.push(format!(
                "#{i:<3} alice@{} -> (dropped, {} byte header)",
                alice.epoch(),
                header.len()
            ));
            continue;
        }

        let plaintext = bob
            .decrypt(&ct, &header)
            .with_context(|| format!("Bob failed to decrypt message {i}"))?;
        summary.delivered += 1;
        summary.transcript.push(format!(
            "#{i:<3} alice@{} -> bob@{}  ct {} bytes, header {} bytes: {}",
            alice.epoch(),
            bob.epoch(),
            ct.len(),
            header.len(),
            String::from_utf8_lossy(&plaintext)
        ));

        let ack = format!("ack {i}");
        let (ct, header) = bob
            .encrypt(ack.as_bytes(), false)
            .with_context(|| format!("Bob failed to acknowledge message {i}"))?;
        let plaintext = alice
            .decrypt(&ct, &header)
            .with_context(|| format!("Alice failed to decrypt ack {i}"))?;
        summary.transcript.push(format!(
            "     bob@{} -> alice@{}: {}",
            bob.epoch(),
            alice.epoch(),
            String::from_utf8_lossy(&plaintext)
        ));
    }

    summary.alice_epoch = alice.epoch();
    summary.bob_epoch = bob.epoch();
    summary.transcript.push(format!(
        "done: {} delivered, {} dropped, alice epoch {}, bob epoch {}",
        summary.delivered, summary.dropped, summary.alice_epoch, summary.bob_epoch
    ));
    Ok(summary)
}
