//! Line-oriented chat REPL.
//!
//! Two people run `triple-ratchet chat` in separate terminals, swap macro
//! keys with `peer <hex>`, and paste each other's `recv ...` lines. Every
//! failure is reported on the output and leaves the session as it was.

use std::io::{BufRead, Write};

use anyhow::{Context, Result, bail};
use triple_ratchet::{SessionConfig, TripleSession};

/// One parsed REPL line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Peer(Vec<u8>),
    Send(String),
    Rotate(String),
    Recv { ciphertext: Vec<u8>, header: Vec<u8> },
    Status,
    Help,
    Quit,
}

const HELP: &str = "commands:
  peer <hex>                  set the peer's macro public key
  send <text>                 encrypt a message
  rotate <text>               rotate the macro ratchet, then encrypt
  recv <ct-hex> <header-hex>  decrypt a message from the peer
  status                      show epochs and keys
  quit";

fn decode_hex(what: &str, text: &str) -> Result<Vec<u8>> {
    hex::decode(text).with_context(|| format!("{what} is not valid hex"))
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    let command = match verb {
        "peer" => Command::Peer(decode_hex("peer key", rest)?),
        "send" => Command::Send(rest.to_owned()),
        "rotate" => Command::Rotate(rest.to_owned()),
        "recv" => {
            let mut parts = rest.split_whitespace();
            let (Some(ct), Some(header), None) = (parts.next(), parts.next(), parts.next())
            else {
                bail!("usage: recv <ciphertext-hex> <header-hex>");
            };
            Command::Recv {
                ciphertext: decode_hex("ciphertext", ct)?,
                header: decode_hex("header", header)?,
            }
        }
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command {other:?}; try `help`"),
    };
    Ok(Some(command))
}

/// A chat participant.
pub struct Chat {
    name: String,
    session: TripleSession,
    /// Force a rotation on the next `send`, then clear.
    rotate_next_send: bool,
}

impl Chat {
    pub fn new(
        name: impl Into<String>,
        config: SessionConfig,
        peer_key: Option<&str>,
        rotate_next_send: bool,
    ) -> Result<Self> {
        let peer = peer_key
            .map(|key| decode_hex("peer key", key.trim()))
            .transpose()?;
        let session = TripleSession::with_config(config, None, peer.as_deref())
            .context("Failed to create session")?;
        Ok(Self {
            name: name.into(),
            session,
            rotate_next_send,
        })
    }

    pub const fn session(&self) -> &TripleSession {
        &self.session
    }

    fn encrypt(&mut self, text: &str, rotate: bool) -> Result<String> {
        let (ciphertext, header) = self.session.encrypt(text.as_bytes(), rotate)?;
        Ok(format!(
            "recv {} {}",
            hex::encode(ciphertext),
            hex::encode(header)
        ))
    }

    fn status(&self) -> String {
        let peer = self
            .session
            .peer_macro_pk()
            .map_or_else(|| "unknown".to_owned(), hex::encode);
        format!(
            "{}: epoch {}, anchored {}\n  macro key {}\n  peer key  {} (epoch {})",
            self.name,
            self.session.epoch(),
            self.session.is_anchored(),
            hex::encode(self.session.macro_pk()),
            peer,
            self.session.peer_epoch()
        )
    }

    /// Apply a command, returning the text to show. `None` means quit.
    pub fn execute(&mut self, command: Command) -> Result<Option<String>> {
        let reply = match command {
            Command::Peer(key) => {
                self.session.set_peer_macro_pk(&key)?;
                format!("peer key set; epoch {}", self.session.epoch())
            }
            Command::Send(text) => {
                let line = self.encrypt(&text, self.rotate_next_send)?;
                self.rotate_next_send = false;
                line
            }
            Command::Rotate(text) => self.encrypt(&text, true)?,
            Command::Recv { ciphertext, header } => {
                let plaintext = self.session.decrypt(&ciphertext, &header)?;
                format!(
                    "[epoch {}] {}",
                    self.session.epoch(),
                    String::from_utf8_lossy(&plaintext)
                )
            }
            Command::Status => self.status(),
            Command::Help => HELP.to_owned(),
            Command::Quit => return Ok(None),
        };
        Ok(Some(reply))
    }

    /// Read commands from `input` until EOF or `quit`.
    pub fn run(&mut self, input: impl BufRead, mut output: impl Write) -> Result<()> {
        writeln!(
            output,
            "{} macro key: {}",
            self.name,
            hex::encode(self.session.macro_pk())
        )?;
        writeln!(output, "type `help` for commands")?;

        for line in input.lines() {
            let line = line.context("Failed to read input")?;
            let result = parse_command(&line).and_then(|command| match command {
                Some(command) => self.execute(command),
                None => Ok(Some(String::new())),
            });
            match result {
                Ok(Some(reply)) if reply.is_empty() => {}
                Ok(Some(reply)) => writeln!(output, "{reply}")?,
                Ok(None) => break,
                Err(e) => writeln!(output, "error: {e:#}")?,
            }
            output.flush()?;
        }
        Ok(())
    }
}
