//! Built-in token substitution.
//!
//! The minimal in-process resolver: `{{input}}`, `{{previousOutput}}`,
//! `{{variables.*}}`, plus pipeline/step metadata and timing tokens. A
//! resolved value may itself contain further tokens; resolution recurses
//! with a hard depth cap so accidental self-reference surfaces as a
//! `Prompt`-kind error instead of an infinite loop.

use async_trait::async_trait;
use serde_json::Value;

use super::{PromptResolver, ResolveContext, ResolveError, ResolveOptions};

/// Maximum nesting depth for tokens whose values contain further tokens.
const MAX_RESOLVE_DEPTH: usize = 5;

/// The default [`PromptResolver`] and the fallback when an external
/// resolver fails.
#[derive(Debug, Clone, Default)]
pub struct TokenResolver;

impl TokenResolver {
    pub fn new() -> Self {
        Self
    }

    /// Scan `text` for `{{token}}` placeholders.
    fn find_tokens(text: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut rest = text;
        while let Some(open) = rest.find("{{") {
            let after = &rest[open + 2..];
            match after.find("}}") {
                Some(close) => {
                    let token = after[..close].trim();
                    if !token.is_empty() {
                        tokens.push(token.to_string());
                    }
                    rest = &after[close + 2..];
                }
                None => break,
            }
        }
        tokens
    }

    /// Render a JSON value for inline substitution. Strings go in bare;
    /// everything else is compact JSON.
    fn render(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn lookup(token: &str, ctx: &ResolveContext) -> Option<String> {
        match token {
            "input" => Some(Self::render(&ctx.input)),
            "previousOutput" => ctx.previous_output.as_ref().map(Self::render),
            "pipeline.id" => Some(ctx.pipeline_id.clone()),
            "pipeline.name" => Some(ctx.pipeline_name.clone()),
            "step.id" => Some(ctx.step_id.clone()),
            "step.name" => Some(ctx.step_name.clone()),
            "startedAt" => ctx.started_at.map(|t| t.to_rfc3339()),
            _ => {
                if let Some(name) = token.strip_prefix("variables.") {
                    ctx.variables.get(name).map(Self::render)
                } else if let Some(key) = token.strip_prefix("store.") {
                    ctx.store_snapshot
                        .as_ref()
                        .and_then(|snap| snap.data.get(key))
                        .map(Self::render)
                } else {
                    None
                }
            }
        }
    }

    /// One substitution pass. Returns the new text and whether anything
    /// was replaced.
    fn substitute_once(text: &str, ctx: &ResolveContext) -> (String, bool) {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        let mut replaced = false;

        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            match after.find("}}") {
                Some(close) => {
                    let token = after[..close].trim();
                    match Self::lookup(token, ctx) {
                        Some(value) => {
                            out.push_str(&value);
                            replaced = true;
                        }
                        None => {
                            // Unknown token, kept verbatim for this pass.
                            out.push_str(&rest[open..open + 2 + close + 2]);
                        }
                    }
                    rest = &after[close + 2..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        (out, replaced)
    }
}

#[async_trait]
impl PromptResolver for TokenResolver {
    async fn resolve(
        &self,
        template: &str,
        ctx: &ResolveContext,
        opts: &ResolveOptions,
    ) -> Result<String, ResolveError> {
        let mut text = template.to_string();

        for depth in 0..=MAX_RESOLVE_DEPTH {
            if Self::find_tokens(&text).is_empty() {
                return Ok(text);
            }
            let (next, replaced) = Self::substitute_once(&text, ctx);
            if !replaced {
                // Only unknown tokens remain.
                if opts.preserve_unresolved {
                    return Ok(next);
                }
                return Err(ResolveError::UnresolvedTokens(Self::find_tokens(&next)));
            }
            text = next;
            if depth == MAX_RESOLVE_DEPTH {
                return Err(ResolveError::DepthExceeded(MAX_RESOLVE_DEPTH));
            }
        }

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ResolveContext {
        let mut variables = std::collections::HashMap::new();
        variables.insert("tone".to_string(), json!("wistful"));
        ResolveContext {
            input: json!("a lighthouse keeper"),
            previous_output: Some(json!("She kept the lamp burning.")),
            variables,
            pipeline_id: "p1".to_string(),
            pipeline_name: "Story".to_string(),
            step_id: "draft".to_string(),
            step_name: "Draft".to_string(),
            store_snapshot: None,
            started_at: None,
        }
    }

    #[tokio::test]
    async fn test_resolves_core_tokens() {
        let resolver = TokenResolver::new();
        let out = resolver
            .resolve(
                "Write about {{input}} in a {{variables.tone}} tone. Prior: {{previousOutput}}",
                &ctx(),
                &ResolveOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            out,
            "Write about a lighthouse keeper in a wistful tone. Prior: She kept the lamp burning."
        );
    }

    #[tokio::test]
    async fn test_unknown_token_errors_by_default() {
        let resolver = TokenResolver::new();
        let err = resolver
            .resolve("{{nope}}", &ctx(), &ResolveOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, ResolveError::UnresolvedTokens(vec!["nope".to_string()]));
    }

    #[tokio::test]
    async fn test_preserve_unresolved_keeps_placeholder() {
        let resolver = TokenResolver::new();
        let out = resolver
            .resolve(
                "{{input}} and {{nope}}",
                &ctx(),
                &ResolveOptions {
                    preserve_unresolved: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(out, "a lighthouse keeper and {{nope}}");
    }

    #[tokio::test]
    async fn test_nested_tokens_resolve_within_cap() {
        let mut context = ctx();
        context
            .variables
            .insert("outer".to_string(), json!("level {{variables.inner}}"));
        context.variables.insert("inner".to_string(), json!("two"));

        let resolver = TokenResolver::new();
        let out = resolver
            .resolve("{{variables.outer}}", &context, &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(out, "level two");
    }

    #[tokio::test]
    async fn test_self_reference_hits_depth_cap() {
        let mut context = ctx();
        context
            .variables
            .insert("loop".to_string(), json!("again {{variables.loop}}"));

        let resolver = TokenResolver::new();
        let err = resolver
            .resolve("{{variables.loop}}", &context, &ResolveOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, ResolveError::DepthExceeded(MAX_RESOLVE_DEPTH));
    }

    #[tokio::test]
    async fn test_metadata_tokens() {
        let resolver = TokenResolver::new();
        let out = resolver
            .resolve(
                "{{pipeline.name}} / {{step.name}}",
                &ctx(),
                &ResolveOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(out, "Story / Draft");
    }
}
