//! Stage instructions.
//!
//! These describe only the output contract of each stage. Persona and
//! domain wording belong to the deployment, not the engine.

pub const ROUTE: &str = r#"Classify the user's latest message.
Reply with JSON only: {"intent": "<short_snake_case_label>", "scope": ["<subdomain>", ...]}
Scope lists the subdomains the message touches, chosen from [Subdomains]."#;

pub const UNDERSTAND: &str = r#"Decide which entities stay in view for this conversation.
Every entity is listed in [Entities] with its token, tier and payload.
Retain an entity the user is still working with, giving a short reason.
Demote an entity the user has ruled out or moved past.
Leave everything else alone; unlisted entities keep their current state.
Reply with JSON only:
{"retain": [{"ref": "<token>", "reason": "<why>"}], "demote": ["<token>", ...]}"#;

pub const PLAN: &str = r#"Plan how to answer the user's latest message.
Choose exactly one decision and reply with JSON only.

Act now:
{"decision": "direct", "goal": "...", "steps": [
  {"description": "...", "subdomain": "<subdomain>", "step_type": "read|write|analyze|generate",
   "complexity": "low|medium|high"}
]}
Use an empty step list when no data work is needed.

State assumptions and wait for confirmation:
{"decision": "propose", "goal": "...", "assumptions": ["..."], "steps": [...]}

Ask before planning:
{"decision": "clarify", "context": "...", "questions": ["..."]}

Entities in [Entities] are already loaded; refer to them by token instead of reading
them again. If [Pending] holds an earlier proposal or question, the user's message is
most likely the answer to it."#;

pub const REPLAN: &str = r#"A step of the current plan is blocked (see [Blocked]).
Replace the steps named in [Blocked] with new ones that get around the problem.
Reply with the same JSON as a direct plan; an empty step list drops them."#;

pub const EXECUTE: &str = r#"Carry out [Current Step]. Reply with exactly one JSON action per message:

{"action": "tool_call", "op": "read|create|update|delete", "collection": "...",
 "filters": [{"field": "...", "op": "eq|neq|gt|gte|lt|lte|contains|in", "value": ...}],
 "data": {...}, "limit": 20}
{"action": "request_schema", "collection": "..."}
{"action": "step_complete", "note": "...", "conclusions": ["..."],
 "generated": [{"entity_type": "...", "label": "...", "content": {...}}]}
{"action": "ask_user", "question": "..."}
{"action": "blocked", "reason_code": "INSUFFICIENT_INFO|PLAN_INVALID|TOOL_FAILURE",
 "details": "...", "suggested_next": "ask_user|replan|fail", "question": "...",
 "invalidates_earlier": false}
{"action": "fail", "reason": "..."}

Never invent ids. To target a record, filter on "id" with its token (e.g. "recipe_2").
Records you already have are in [Entities] and [Step Results]; do not read them again."#;

pub const REPLY: &str = r#"Write the reply to the user's latest message from [Outcomes].
Refer to things by name. Do not mention tokens, steps or tools.
Reply with JSON {"reply": "...", "tone": "<one word>"} or with the reply text alone."#;

pub const FOLD: &str = r#"Summarize this exchange in one sentence of at most 30 words.
Keep names, quantities and decisions. Reply with the sentence only."#;

pub const HANDOFF: &str = r#"The user is leaving this mode. Summarize the exchange below and say what
should happen to it. Reply with JSON only:
{"summary": "...", "action": "save|update|close", "action_detail": "..."}
Use save for something new worth keeping, update for a change to something that exists,
close when nothing needs to happen."#;
