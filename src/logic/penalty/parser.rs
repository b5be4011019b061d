//! Action Parser - punishment command templates
//!
//! `kick:` and `ban:` prefixes select the action kind (case-insensitive);
//! anything else is a raw console command. Placeholders `{PLAYER}`, `{VL}`,
//! `{PROBABILITY}` and `{BUFFER}` are substituted at dispatch time.

use super::types::{ActionError, ActionKind, ParsedAction, PenaltyContext};

const KINDS: [ActionKind; 2] = [ActionKind::Kick, ActionKind::Ban];

/// Split a configured command into kind and body
pub fn parse(raw: &str) -> ParsedAction {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ParsedAction::new(ActionKind::Raw, "");
    }

    for kind in KINDS {
        let Some(prefix) = kind.prefix() else { continue };
        let head = trimmed.get(..prefix.len());
        if head.is_some_and(|h| h.eq_ignore_ascii_case(prefix)) {
            return ParsedAction::new(kind, trimmed[prefix.len()..].trim());
        }
    }

    ParsedAction::new(ActionKind::Raw, trimmed)
}

/// True when the command carries a kind prefix
pub fn has_action_prefix(raw: &str) -> bool {
    parse(raw).kind != ActionKind::Raw
}

/// Substitute placeholders
pub fn render(template: &str, context: &PenaltyContext) -> String {
    template
        .replace("{PLAYER}", &context.player_name)
        .replace("{VL}", &context.violation_level.to_string())
        .replace("{PROBABILITY}", &format!("{:.2}", context.probability))
        .replace("{BUFFER}", &format!("{:.1}", context.buffer))
}

/// Parse and render in one step
pub fn resolve(raw: &str, context: &PenaltyContext) -> Result<ParsedAction, ActionError> {
    let parsed = parse(raw);
    if !parsed.has_command() {
        return Err(ActionError::EmptyCommand);
    }
    Ok(ParsedAction::new(parsed.kind, render(&parsed.command, context)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn context() -> PenaltyContext {
        PenaltyContext {
            player_uuid: Uuid::nil(),
            player_name: "Notch".to_string(),
            violation_level: 3,
            probability: 0.934,
            buffer: 77.3,
        }
    }

    #[test]
    fn test_parse_prefixes() {
        assert_eq!(parse("kick:kick {PLAYER}").kind, ActionKind::Kick);
        assert_eq!(parse("BAN: ban {PLAYER} 7d").command, "ban {PLAYER} 7d");
        assert_eq!(parse("say hi").kind, ActionKind::Raw);
        assert_eq!(parse("   "), ParsedAction::new(ActionKind::Raw, ""));
        assert!(has_action_prefix("Kick:x"));
        assert!(!has_action_prefix("kickx"));
    }

    #[test]
    fn test_render_placeholders() {
        let rendered = render("ban {PLAYER} VL={VL} p={PROBABILITY} b={BUFFER}", &context());
        assert_eq!(rendered, "ban Notch VL=3 p=0.93 b=77.3");
    }

    #[test]
    fn test_resolve_rejects_empty() {
        assert_eq!(resolve("kick:", &context()), Err(ActionError::EmptyCommand));
        let action = resolve("kick:kick {PLAYER}", &context()).unwrap();
        assert_eq!(action.command, "kick Notch");
        assert!(action.kind.is_disconnect());
    }
}
