//! `turnkeep chat`: interactive or single-message chat.

use super::runtime::{build_engine, load_config};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use turnkeep_core::event::{EventBus, ProgressEvent};
use turnkeep_core::session::SessionKey;
use turnkeep_engine::{TurnEngine, TurnRequest};

#[derive(Debug, PartialEq)]
enum Input {
    Empty,
    Quit,
    /// Switch mode; `None` returns to the pipeline.
    Mode(Option<String>),
    Message(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    match line.split_once(' ').map_or((line, ""), |(c, rest)| (c, rest.trim())) {
        ("", _) => Input::Empty,
        ("/quit" | "/exit", _) => Input::Quit,
        ("/pipeline", _) | ("/mode", "") => Input::Mode(None),
        ("/mode", name) => Input::Mode(Some(name.to_string())),
        _ => Input::Message(line.to_string()),
    }
}

/// One progress line for the terminal, if the event deserves one.
fn render_progress(event: &ProgressEvent) -> Option<String> {
    match event {
        ProgressEvent::StepStarted {
            index,
            description,
            tier,
        } => Some(format!("  [{}] {description} ({tier})", index + 1)),
        ProgressEvent::StepFinished {
            index,
            outcome,
            note,
        } if note.is_empty() => Some(format!("  [{}] {outcome}", index + 1)),
        ProgressEvent::StepFinished {
            index,
            outcome,
            note,
        } => Some(format!("  [{}] {outcome}: {note}", index + 1)),
        _ => None,
    }
}

/// Print progress until the turn ends. Returns whether any chunks were
/// streamed to stdout.
async fn print_progress(mut rx: broadcast::Receiver<Arc<ProgressEvent>>) -> bool {
    let mut streamed = false;
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let ProgressEvent::Chunk { content } = event.as_ref() {
                    if !streamed {
                        print!("\n  Assistant > ");
                        streamed = true;
                    }
                    print!("{content}");
                    let _ = std::io::stdout().flush();
                } else if let Some(line) = render_progress(&event) {
                    eprintln!("{line}");
                }
                if event.is_terminal() {
                    return streamed;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return streamed,
        }
    }
}

async fn send(
    engine: &TurnEngine,
    key: &SessionKey,
    message: &str,
    mode: Option<String>,
) -> anyhow::Result<()> {
    let bus = EventBus::default();
    let printer = tokio::spawn(print_progress(bus.subscribe()));

    let mut request = TurnRequest::new(message);
    request.mode = mode;
    let outcome = engine.run_turn(key, request, &bus).await;
    let streamed = printer.await.unwrap_or(false);
    let result = outcome?;

    if let Some(handoff) = &result.handoff {
        eprintln!("  (left {} mode: {})", handoff.mode, handoff.summary);
    }
    println!();
    if !streamed {
        for line in result.reply.lines() {
            println!("  Assistant > {line}");
        }
    }
    println!();
    Ok(())
}

pub async fn run(
    user: &str,
    session: &str,
    message: Option<String>,
    mode: Option<String>,
) -> anyhow::Result<()> {
    let config = load_config()?;
    let engine = build_engine(config).await?;
    let key = SessionKey::new(user, session);

    if let Some(message) = message {
        return send(&engine, &key, &message, mode).await;
    }

    let mut mode = mode;
    println!();
    println!("  turnkeep chat, session {key}");
    println!("  /mode <name> enters a bypass mode, /pipeline leaves it, /quit exits.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match &mode {
            Some(name) => print!("  You ({name}) > "),
            None => print!("  You > "),
        }
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        match parse_input(&line) {
            Input::Empty => continue,
            Input::Quit => break,
            Input::Mode(next) => {
                if let Some(name) = &next {
                    if engine.config().engine.mode(name).is_none() {
                        eprintln!("  [Error] There is no '{name}' mode.");
                        continue;
                    }
                }
                mode = next;
            }
            Input::Message(text) => {
                if let Err(e) = send(&engine, &key, &text, mode.clone()).await {
                    eprintln!("  [Error] {e}");
                }
            }
        }
    }

    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_commands() {
        assert_eq!(parse_input("   "), Input::Empty);
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input("/mode freeform"), Input::Mode(Some("freeform".into())));
        assert_eq!(parse_input("/mode"), Input::Mode(None));
        assert_eq!(parse_input("/pipeline"), Input::Mode(None));
        assert_eq!(
            parse_input(" what's in the pantry? "),
            Input::Message("what's in the pantry?".into())
        );
    }

    #[test]
    fn progress_lines() {
        let started = ProgressEvent::StepStarted {
            index: 0,
            description: "Read pantry".into(),
            tier: "low".into(),
        };
        assert_eq!(render_progress(&started).unwrap(), "  [1] Read pantry (low)");

        let finished = ProgressEvent::StepFinished {
            index: 1,
            outcome: "blocked".into(),
            note: "tool failure".into(),
        };
        assert_eq!(render_progress(&finished).unwrap(), "  [2] blocked: tool failure");
        assert!(render_progress(&ProgressEvent::Ping).is_none());
    }

    #[tokio::test]
    async fn printer_stops_at_terminal_event() {
        let bus = EventBus::default();
        let printer = tokio::spawn(print_progress(bus.subscribe()));
        bus.publish(ProgressEvent::Chunk {
            content: "Hi".into(),
        });
        bus.publish(ProgressEvent::Done {
            turn_number: 1,
            reply: "Hi".into(),
        });
        assert!(printer.await.unwrap());
    }
}
