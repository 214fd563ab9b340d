//! `turnkeep session`: inspect stored sessions.

use super::runtime::{load_config, session_store};
use anyhow::anyhow;
use std::fmt::Write;
use turnkeep_core::session::{SessionDocument, SessionKey};

fn render(key: &SessionKey, doc: &SessionDocument) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Session {key}");
    let _ = writeln!(
        out,
        "   Version: {}   Turns: {}   Mode: {}",
        doc.version,
        doc.turn_count,
        doc.active_mode.as_deref().unwrap_or("pipeline")
    );

    if let Some(pending) = &doc.pending {
        let _ = writeln!(out, "\nPending\n   {}", pending.render().replace('\n', "\n   "));
    }

    let _ = writeln!(out, "\nEntities ({})", doc.registry.len());
    for entity in doc.registry.iter() {
        let mut line = format!(
            "   {:<16} {:<24} {:<9} last turn {}",
            entity.ref_token,
            entity.label,
            entity.status.as_str(),
            entity.turn_last_referenced
        );
        if let Some(turn) = entity.demoted_turn {
            let _ = write!(line, ", demoted turn {turn}");
        }
        if let Some(reason) = &entity.retention_reason {
            let _ = write!(line, ", retained: {reason}");
        }
        let _ = writeln!(out, "{line}");
    }

    if !doc.history.history_summary.is_empty() {
        let _ = writeln!(
            out,
            "\nEarlier (through turn {})\n   {}",
            doc.history.compressed_through, doc.history.history_summary
        );
    }
    if !doc.history.recent.is_empty() {
        let _ = writeln!(out, "\nRecent turns");
        for turn in &doc.history.recent {
            let _ = writeln!(
                out,
                "   {}. You: {}\n      Assistant: {}",
                turn.turn_number, turn.user_text, turn.assistant_summary
            );
        }
    }
    out
}

pub async fn show(user: &str, id: &str, json: bool) -> anyhow::Result<()> {
    let config = load_config()?;
    let store = session_store(&config).await?;
    let key = SessionKey::new(user, id);
    let doc = store
        .load(&key)
        .await?
        .ok_or_else(|| anyhow!("No session '{id}' for user '{user}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        print!("{}", render(&key, &doc));
    }
    Ok(())
}

pub async fn list(user: &str) -> anyhow::Result<()> {
    let config = load_config()?;
    let store = session_store(&config).await?;
    let sessions = store.list(user).await?;
    if sessions.is_empty() {
        println!("No sessions for user '{user}'");
    }
    for id in sessions {
        println!("{id}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnkeep_core::entity::EntityStatus;

    #[test]
    fn render_lists_entities_and_demotions() {
        let mut doc = SessionDocument::new();
        doc.turn_count = 2;
        doc.registry
            .register("recipe", "id-1", "Cod Tacos", EntityStatus::Read, 1);
        doc.registry
            .register("recipe", "id-2", "Red Lentil Dal", EntityStatus::Read, 1);
        doc.registry.curate(2, &[], &["recipe_1".into()]);

        let text = render(&SessionKey::new("u1", "s1"), &doc);
        assert!(text.starts_with("Session u1/s1"));
        assert!(text.contains("Entities (2)"));
        assert!(text.contains("recipe_2"));
        assert!(text.contains("demoted turn 2"));
        assert!(!text.contains("id-1"));
    }
}
