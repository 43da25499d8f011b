//! Interactive loop: one line in, one streamed answer out.

use std::io::Write;

use phi_chat_core::session::stream_channel;
use phi_chat_core::{ChatSession, ChatTurn, StreamChunk};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

const HELP: &str = "commands: /history, /clear, /help, /exit";

enum Command<'a> {
    Ask(&'a str),
    History,
    Clear,
    Help,
    Exit,
}

fn parse(line: &str) -> Option<Command<'_>> {
    match line.trim() {
        "" => None,
        "/exit" | "/quit" => Some(Command::Exit),
        "/history" => Some(Command::History),
        "/clear" => Some(Command::Clear),
        "/help" => Some(Command::Help),
        text => Some(Command::Ask(text)),
    }
}

/// The turns sent for `text`; a fresh conversation starts with `system`.
pub fn turns_for(session: &ChatSession, system: Option<&str>, text: &str) -> anyhow::Result<Vec<ChatTurn>> {
    let mut turns = Vec::with_capacity(2);
    if let Some(system) = system {
        if session.history()?.is_empty() {
            turns.push(ChatTurn::system(system));
        }
    }
    turns.push(ChatTurn::user(text));
    Ok(turns)
}

pub async fn run(session: &ChatSession, system: Option<&str>) -> anyhow::Result<()> {
    let turns = session.history()?.len();
    if turns > 0 {
        eprintln!("[resuming conversation with {turns} turns]");
    }
    eprintln!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        std::io::stderr().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match parse(&line) {
            None => continue,
            Some(Command::Exit) => break,
            Some(Command::Help) => eprintln!("{HELP}"),
            Some(Command::History) => {
                for turn in session.history()? {
                    println!("[{}] {}", turn.role, turn.content);
                }
            }
            Some(Command::Clear) => {
                session.clear_history()?;
                eprintln!("[conversation cleared]");
            }
            Some(Command::Ask(text)) => {
                let turns = turns_for(session, system, text)?;
                if let Err(e) = ask(session, turns).await {
                    warn!(error = %e, "generation failed");
                    eprintln!("error: {e:#}");
                }
            }
        }
    }
    Ok(())
}

/// Stream one answer to stdout. Ctrl-C interrupts the generation.
pub async fn ask(session: &ChatSession, turns: Vec<ChatTurn>) -> anyhow::Result<()> {
    let (tx, mut rx) = stream_channel();
    let generation = session.generate_with_stream(turns, Some(tx));
    tokio::pin!(generation);

    let mut stdout = std::io::stdout();
    let result = loop {
        tokio::select! {
            result = &mut generation => break result,
            Some(chunk) = rx.recv() => print_chunk(&mut stdout, chunk)?,
            _ = tokio::signal::ctrl_c() => {
                session.interrupt();
            }
        }
    };
    while let Ok(chunk) = rx.try_recv() {
        print_chunk(&mut stdout, chunk)?;
    }
    println!();

    let outcome = result?;
    let tps = outcome
        .metrics
        .tokens_per_second
        .map(|tps| format!("{tps:.2} tok/s"))
        .unwrap_or_else(|| "n/a tok/s".to_owned());
    let note = if outcome.interrupted() {
        if outcome.persisted { ", interrupted" } else { ", interrupted, not saved" }
    } else {
        ""
    };
    eprintln!("[{} tokens, {tps}{note}]", outcome.metrics.num_tokens);
    Ok(())
}

fn print_chunk(out: &mut impl Write, chunk: StreamChunk) -> std::io::Result<()> {
    if let StreamChunk::Token(text) = chunk {
        write!(out, "{text}")?;
        out.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_recognised() {
        assert!(parse("   ").is_none());
        assert!(matches!(parse("/quit"), Some(Command::Exit)));
        assert!(matches!(parse(" /clear "), Some(Command::Clear)));
        assert!(matches!(parse("hi there"), Some(Command::Ask("hi there"))));
    }

    #[test]
    fn only_token_chunks_are_printed() {
        let mut out = Vec::new();
        print_chunk(&mut out, StreamChunk::Token("Hel".into())).unwrap();
        print_chunk(&mut out, StreamChunk::Token("lo".into())).unwrap();
        print_chunk(&mut out, StreamChunk::Done).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Hello");
    }
}
