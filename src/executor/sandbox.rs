//! Sandbox for `code` steps
//!
//! A `code` step's action is source for direct automation. The sandbox
//! exposes exactly four surfaces: the page proxy, an `expect` facade, timer
//! primitives, and read-only resolved variables and file references. No
//! network, file system, subprocess, or host access exists inside it.
//!
//! Statements are validated against a conservative token blocklist, split on
//! semicolons with bracket/quote balancing, syntax-checked once up front,
//! and then executed one at a time under a per-statement deadline. File
//! paths handed to `setInputFiles` are confined to the test case's upload
//! directory, narrowed further by the step's file allowlist.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::browser::PageHandle;

/// Tokens that end validation immediately. Matching is a plain substring
/// scan: false positives are acceptable, false negatives are not.
const BLOCKED_TOKENS: [&str; 16] = [
    "require(",
    "import ",
    "import(",
    "process.",
    "child_process",
    "eval(",
    "Function(",
    "new Function",
    "globalThis",
    "__proto__",
    "constructor[",
    "fetch(",
    "XMLHttpRequest",
    "WebSocket",
    "Deno",
    "document.cookie",
];

/// Reject code containing blocked tokens before anything is parsed.
pub fn validate_code(source: &str) -> Result<(), String> {
    for token in BLOCKED_TOKENS {
        if source.contains(token) {
            return Err(format!("Unsafe token '{}' is not allowed in code steps", token.trim_end_matches('(')));
        }
    }
    Ok(())
}

/// Split source into statements on top-level semicolons.
///
/// Quotes (single, double, backtick) and brackets are respected; an
/// unterminated string or unbalanced bracket fails the whole step.
pub fn split_statements(source: &str) -> Result<Vec<String>, String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for ch in source.chars() {
        if let Some(open) = quote {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => {
                quote = Some(ch);
                current.push(ch);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(ch);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                if depth < 0 {
                    return Err("Unbalanced brackets in code step".to_string());
                }
                current.push(ch);
            }
            ';' if depth == 0 => {
                let statement = current.trim().to_string();
                if !statement.is_empty() {
                    statements.push(statement);
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }

    if quote.is_some() {
        return Err("Unterminated string in code step".to_string());
    }
    if depth != 0 {
        return Err("Unbalanced brackets in code step".to_string());
    }
    let trailing = current.trim().to_string();
    if !trailing.is_empty() {
        statements.push(trailing);
    }
    Ok(statements)
}

#[derive(Debug, Clone, PartialEq)]
enum Matcher {
    Equals(String),
    Contains(String),
}

#[derive(Debug, Clone, PartialEq)]
enum FileArg {
    /// `files.invoice` or `files['invoice']`
    Reference(String),
    /// A relative path under the upload directory.
    Path(String),
}

#[derive(Debug, Clone, PartialEq)]
enum SandboxCall {
    Goto(String),
    Click(String),
    Fill { selector: String, text: String },
    SetInputFiles { selector: String, file: FileArg },
    WaitMillis(u64),
    Evaluate(String),
    ExpectUrl(Matcher),
    ExpectTitle(Matcher),
}

#[derive(Debug, Clone, PartialEq)]
enum Arg {
    Str(String),
    Number(f64),
    Ident(String),
}

/// Execution environment for one `code` step.
pub struct CodeSandbox {
    page: Arc<dyn PageHandle>,
    variables: HashMap<String, String>,
    files: HashMap<String, PathBuf>,
    upload_dir: PathBuf,
    allowlist: Option<HashSet<String>>,
    statement_timeout: Duration,
}

impl CodeSandbox {
    #[must_use]
    pub fn new(
        page: Arc<dyn PageHandle>,
        variables: HashMap<String, String>,
        files: HashMap<String, PathBuf>,
        upload_dir: PathBuf,
        allowlist: Option<HashSet<String>>,
        statement_timeout: Duration,
    ) -> Self {
        Self {
            page,
            variables,
            files,
            upload_dir,
            allowlist,
            statement_timeout,
        }
    }

    /// Parse every statement once before running any of them, so a syntax
    /// error in statement five fails the step before statement one acts.
    pub fn check_syntax(&self, statements: &[String]) -> Result<(), String> {
        for statement in statements {
            self.parse_statement(statement)?;
        }
        Ok(())
    }

    /// Execute one statement under the per-statement deadline.
    pub async fn execute_statement(&self, statement: &str) -> Result<(), String> {
        let call = self.parse_statement(statement)?;
        // Waits are already capped to the deadline; wrapping them again
        // would race the cap against the timeout.
        if let SandboxCall::WaitMillis(_) = call {
            return self.run_call(call).await;
        }
        let deadline = self.statement_timeout;
        match tokio::time::timeout(deadline, self.run_call(call)).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "Statement timed out after {}s: {statement}",
                deadline.as_secs()
            )),
        }
    }

    async fn run_call(&self, call: SandboxCall) -> Result<(), String> {
        match call {
            SandboxCall::Goto(url) => self
                .page
                .goto(&url)
                .await
                .map_err(|e| format!("goto {url} failed: {e}")),
            SandboxCall::Click(selector) => self
                .page
                .click(&selector)
                .await
                .map_err(|e| format!("click {selector} failed: {e}")),
            SandboxCall::Fill { selector, text } => self
                .page
                .type_text(&selector, &text)
                .await
                .map_err(|e| format!("fill {selector} failed: {e}")),
            SandboxCall::SetInputFiles { selector, file } => {
                // Policy check happens here, before the driver is invoked.
                let path = self.resolve_file_path(&file)?;
                self.page
                    .set_input_files(&selector, &[path])
                    .await
                    .map_err(|e| format!("setInputFiles {selector} failed: {e}"))
            }
            SandboxCall::WaitMillis(ms) => {
                let capped = Duration::from_millis(ms).min(self.statement_timeout);
                tokio::time::sleep(capped).await;
                Ok(())
            }
            SandboxCall::Evaluate(expression) => self
                .page
                .evaluate(&expression)
                .await
                .map(|_| ())
                .map_err(|e| format!("evaluate failed: {e}")),
            SandboxCall::ExpectUrl(matcher) => {
                let actual = self
                    .page
                    .current_url()
                    .await
                    .map_err(|e| format!("could not read page URL: {e}"))?;
                check_matcher("URL", &matcher, &actual)
            }
            SandboxCall::ExpectTitle(matcher) => {
                let actual = self
                    .page
                    .title()
                    .await
                    .map_err(|e| format!("could not read page title: {e}"))?;
                check_matcher("title", &matcher, &actual)
            }
        }
    }

    fn parse_statement(&self, statement: &str) -> Result<SandboxCall, String> {
        let mut source = statement.trim();
        if let Some(stripped) = source.strip_prefix("await ") {
            source = stripped.trim_start();
        }
        let source = source.trim_end_matches(';').trim();

        if let Some(rest) = source.strip_prefix("expect(") {
            return self.parse_expect(rest);
        }

        let (callee, inner) = split_call(source)?;
        match callee.as_str() {
            "page.goto" => {
                let url = self.single_string(&inner, "page.goto")?;
                Ok(SandboxCall::Goto(url))
            }
            "page.click" => {
                let selector = self.single_string(&inner, "page.click")?;
                Ok(SandboxCall::Click(selector))
            }
            "page.fill" | "page.type" => {
                let args = self.parse_args(&inner)?;
                match args.as_slice() {
                    [Arg::Str(selector), Arg::Str(text)] => Ok(SandboxCall::Fill {
                        selector: selector.clone(),
                        text: text.clone(),
                    }),
                    _ => Err(format!("{callee} expects (selector, text)")),
                }
            }
            "page.setInputFiles" => {
                let args = self.parse_args(&inner)?;
                match args.as_slice() {
                    [Arg::Str(selector), Arg::Str(path)] => Ok(SandboxCall::SetInputFiles {
                        selector: selector.clone(),
                        file: FileArg::Path(path.clone()),
                    }),
                    [Arg::Str(selector), Arg::Ident(ident)] => {
                        let id = parse_file_reference(ident).ok_or_else(|| {
                            format!("setInputFiles expects a files reference, got '{ident}'")
                        })?;
                        Ok(SandboxCall::SetInputFiles {
                            selector: selector.clone(),
                            file: FileArg::Reference(id),
                        })
                    }
                    _ => Err("page.setInputFiles expects (selector, file)".to_string()),
                }
            }
            "page.waitForTimeout" | "wait" | "sleep" => {
                let args = self.parse_args(&inner)?;
                match args.as_slice() {
                    [Arg::Number(ms)] if *ms >= 0.0 => Ok(SandboxCall::WaitMillis(*ms as u64)),
                    _ => Err(format!("{callee} expects a millisecond count")),
                }
            }
            "page.evaluate" => {
                let expression = match self.parse_args(&inner) {
                    Ok(args) => match args.as_slice() {
                        [Arg::Str(code)] => code.clone(),
                        _ => inner.trim().to_string(),
                    },
                    Err(_) => inner.trim().to_string(),
                };
                Ok(SandboxCall::Evaluate(expression))
            }
            other => Err(format!("Unsupported statement: {other}(...)")),
        }
    }

    fn parse_expect(&self, after_open: &str) -> Result<SandboxCall, String> {
        let close = find_matching_paren(after_open)
            .ok_or_else(|| "Unbalanced parentheses in expect(...)".to_string())?;
        let subject = after_open[..close].trim();
        let rest = after_open[close + 1..].trim();

        let (method, inner) = split_call(rest.trim_start_matches('.'))?;
        let expected = self.single_string(&inner, "expect matcher")?;
        let matcher = match method.as_str() {
            "toBe" => Matcher::Equals(expected),
            "toContain" => Matcher::Contains(expected),
            other => return Err(format!("Unsupported expect matcher: {other}")),
        };

        match subject {
            "page.url()" => Ok(SandboxCall::ExpectUrl(matcher)),
            "page.title()" => Ok(SandboxCall::ExpectTitle(matcher)),
            other => Err(format!("Unsupported expect subject: {other}")),
        }
    }

    fn single_string(&self, inner: &str, context: &str) -> Result<String, String> {
        let args = self.parse_args(inner)?;
        match args.as_slice() {
            [Arg::Str(value)] => Ok(value.clone()),
            _ => Err(format!("{context} expects a single string argument")),
        }
    }

    fn parse_args(&self, inner: &str) -> Result<Vec<Arg>, String> {
        let mut args = Vec::new();
        for raw in split_top_level_commas(inner)? {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            if let Some(literal) = parse_string_literal(raw) {
                args.push(Arg::Str(self.substitute_variables(&literal)?));
            } else if let Ok(number) = raw.parse::<f64>() {
                args.push(Arg::Number(number));
            } else {
                args.push(Arg::Ident(raw.to_string()));
            }
        }
        Ok(args)
    }

    /// Replace `{{name}}` placeholders from the read-only variable map.
    fn substitute_variables(&self, input: &str) -> Result<String, String> {
        let mut output = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("{{") {
            output.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| "Unterminated variable placeholder".to_string())?;
            let name = after[..end].trim();
            match self.variables.get(name) {
                Some(value) => output.push_str(value),
                None => return Err(format!("Unknown variable '{name}'")),
            }
            rest = &after[end + 2..];
        }
        output.push_str(rest);
        Ok(output)
    }

    fn resolve_file_path(&self, file: &FileArg) -> Result<PathBuf, String> {
        match file {
            FileArg::Reference(id) => {
                if let Some(allowlist) = &self.allowlist {
                    if !allowlist.contains(id) {
                        return Err(format!("File '{id}' is not in this step's file allowlist"));
                    }
                }
                let path = self
                    .files
                    .get(id)
                    .ok_or_else(|| format!("Unknown file reference '{id}'"))?;
                self.confine(path)?;
                Ok(path.clone())
            }
            FileArg::Path(raw) => {
                let relative = Path::new(raw);
                if relative.is_absolute() {
                    return Err(format!(
                        "File path '{raw}' is outside the allowed upload directory"
                    ));
                }
                let joined = self.upload_dir.join(relative);
                self.confine(&joined)?;
                if let Some(allowlist) = &self.allowlist {
                    let allowed = allowlist.iter().any(|id| {
                        self.files.get(id).is_some_and(|path| path == &joined)
                    });
                    if !allowed {
                        return Err(format!(
                            "File path '{raw}' is not in this step's file allowlist"
                        ));
                    }
                }
                Ok(joined)
            }
        }
    }

    /// Every path must stay inside `<upload_root>/<test_case_id>`, checked
    /// lexically so the policy holds even for not-yet-existing files.
    fn confine(&self, path: &Path) -> Result<(), String> {
        if path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(format!(
                "File path '{}' is outside the allowed upload directory",
                path.display()
            ));
        }
        if !path.starts_with(&self.upload_dir) {
            return Err(format!(
                "File path '{}' is outside the allowed upload directory",
                path.display()
            ));
        }
        Ok(())
    }
}

fn check_matcher(what: &str, matcher: &Matcher, actual: &str) -> Result<(), String> {
    match matcher {
        Matcher::Equals(expected) if actual == expected => Ok(()),
        Matcher::Contains(expected) if actual.contains(expected.as_str()) => Ok(()),
        Matcher::Equals(expected) => Err(format!(
            "Expected {what} to be \"{expected}\" but got \"{actual}\""
        )),
        Matcher::Contains(expected) => Err(format!(
            "Expected {what} to contain \"{expected}\" but got \"{actual}\""
        )),
    }
}

/// Split `callee(inner)` and reject trailing garbage.
fn split_call(source: &str) -> Result<(String, String), String> {
    let open = source
        .find('(')
        .ok_or_else(|| format!("Unsupported statement: {source}"))?;
    let callee = source[..open].trim().to_string();
    let after = &source[open + 1..];
    let close = find_matching_paren(after)
        .ok_or_else(|| format!("Unbalanced parentheses: {source}"))?;
    let trailing = after[close + 1..].trim();
    if !trailing.is_empty() {
        return Err(format!("Unexpected trailing code: {trailing}"));
    }
    Ok((callee, after[..close].to_string()))
}

/// Index of the `)` matching an already-consumed `(`.
fn find_matching_paren(source: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, ch) in source.char_indices() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => quote = Some(ch),
            '(' => depth += 1,
            ')' => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

fn split_top_level_commas(inner: &str) -> Result<Vec<String>, String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for ch in inner.chars() {
        if let Some(open) = quote {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => {
                quote = Some(ch);
                current.push(ch);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(ch);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if quote.is_some() {
        return Err("Unterminated string in arguments".to_string());
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    Ok(parts)
}

fn parse_string_literal(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    if bytes.len() < 2 {
        return None;
    }
    let open = bytes[0] as char;
    if !matches!(open, '\'' | '"' | '`') || bytes[bytes.len() - 1] as char != open {
        return None;
    }
    let inner = &raw[1..raw.len() - 1];
    let mut output = String::with_capacity(inner.len());
    let mut escaped = false;
    for ch in inner.chars() {
        if escaped {
            output.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == open {
            // Closing quote in the middle means this was not one literal.
            return None;
        } else {
            output.push(ch);
        }
    }
    Some(output)
}

/// `files.invoice` or `files['invoice']` / `files["invoice"]`.
fn parse_file_reference(ident: &str) -> Option<String> {
    if let Some(name) = ident.strip_prefix("files.") {
        if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
            return Some(name.to_string());
        }
        return None;
    }
    let indexed = ident.strip_prefix("files[")?.strip_suffix(']')?;
    parse_string_literal(indexed.trim())
}
