use anyhow::{Context, Result};
use serde_json::json;

use crate::{auth::JwtVerifier, config::token_settings_from_env};

#[derive(Debug, Clone, PartialEq, Eq)]
struct IssueTokenArgs {
    user_id: String,
    email: String,
    permissions: Vec<String>,
}

/// Handles `issue-token` before the server boots. Returns `false` when the
/// process should start serving instead.
pub fn maybe_run_from_cli(args: &[String]) -> Result<bool> {
    if args.len() < 2 || args[1] != "issue-token" {
        return Ok(false);
    }

    let parsed = parse_args(args).context("Invalid issue-token arguments")?;
    let (secret, expiry_hours) = token_settings_from_env()?;
    let verifier = JwtVerifier::new(&secret, expiry_hours);

    let permissions = (!parsed.permissions.is_empty()).then(|| parsed.permissions.clone());
    let token = verifier
        .issue_token(&parsed.user_id, &parsed.email, permissions)
        .map_err(|e| anyhow::anyhow!("Failed to sign token: {}", e.message))?;

    let result = json!({
        "user_id": parsed.user_id,
        "email": parsed.email,
        "expires_in_hours": expiry_hours,
        "token": token
    });
    println!("{}", serde_json::to_string(&result)?);
    Ok(true)
}

fn parse_args(args: &[String]) -> Result<IssueTokenArgs> {
    let mut user_id = None;
    let mut email = None;
    let mut permissions = Vec::new();

    let mut i = 2usize;
    while i < args.len() {
        let key = args[i].as_str();
        let val = args.get(i + 1).cloned();
        match (key, val) {
            ("--user-id", Some(v)) => {
                user_id = Some(v);
                i += 2;
            }
            ("--email", Some(v)) => {
                email = Some(v);
                i += 2;
            }
            ("--permission", Some(v)) => {
                permissions.push(v);
                i += 2;
            }
            _ => {
                anyhow::bail!("Unknown or incomplete argument near `{}`", key);
            }
        }
    }

    Ok(IssueTokenArgs {
        user_id: user_id.context("--user-id is required")?,
        email: email.context("--email is required")?,
        permissions,
    })
}
