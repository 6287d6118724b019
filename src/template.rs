//! Message templates for webhook payloads.
//!
//! The syntax is a small subset of Go's `text/template`: field references
//! (`{{.title}}`, `{{.alert.host}}`, `{{.}}`), `if`/`else if`/`else`, `range`,
//! `with`, comments (`{{/* ... */}}`) and trim markers (`{{-`, `-}}`).
//! Templates only read from the payload they are rendered against; there are
//! no functions, assignments or includes.

use serde_json::{Map, Value};

/// Longest template source accepted, in bytes.
pub const MAX_TEMPLATE_LEN: usize = 16 * 1024;

/// Deepest nesting of `if`, `range` and `with` blocks.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct TemplateError {
    pub line: usize,
    pub message: String,
}

impl TemplateError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// A parsed template, ready to render any number of payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
struct FieldPath(Vec<String>);

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Field(FieldPath),
    If {
        branches: Vec<(FieldPath, Vec<Node>)>,
        otherwise: Vec<Node>,
    },
    Range {
        path: FieldPath,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
    With {
        path: FieldPath,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

/// Renders `payload` with `template`, or with the default format when the
/// template is absent or blank.
pub fn render(payload: &Map<String, Value>, template: Option<&str>) -> Result<String, TemplateError> {
    match template {
        Some(source) if !source.trim().is_empty() => {
            Ok(Template::parse(source)?.render(&Value::Object(payload.clone())))
        }
        _ => Ok(render_default(payload)),
    }
}

/// The `msg` field verbatim if there is one, otherwise one `key: value` line
/// per field in key order. Never fails.
pub fn render_default(payload: &Map<String, Value>) -> String {
    if let Some(msg) = payload.get("msg").filter(|v| !v.is_null()) {
        return display(msg);
    }
    payload
        .iter()
        .map(|(key, value)| format!("{key}: {}", display(value)))
        .collect::<Vec<_>>()
        .join("\n")
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        if source.len() > MAX_TEMPLATE_LEN {
            return Err(TemplateError::new(
                1,
                format!("template is longer than {MAX_TEMPLATE_LEN} bytes"),
            ));
        }
        let tokens = lex(source)?;
        let mut parser = Parser {
            tokens: tokens.into_iter(),
            depth: 0,
        };
        let (nodes, end) = parser.parse_list()?;
        match end {
            Terminator::Eof => Ok(Self { nodes }),
            Terminator::End(line) => Err(TemplateError::new(line, "unexpected {{end}}")),
            Terminator::Else(line) | Terminator::ElseIf(_, line) => {
                Err(TemplateError::new(line, "unexpected {{else}}"))
            }
        }
    }

    pub fn render(&self, data: &Value) -> String {
        let mut out = String::new();
        exec(&self.nodes, data, &mut out);
        out
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

static NULL: Value = Value::Null;

fn lookup<'a>(dot: &'a Value, path: &FieldPath) -> &'a Value {
    path.0.iter().fold(dot, |value, segment| match value {
        Value::Object(map) => map.get(segment).unwrap_or(&NULL),
        _ => &NULL,
    })
}

fn exec(nodes: &[Node], dot: &Value, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Field(path) => out.push_str(&display(lookup(dot, path))),
            Node::If {
                branches,
                otherwise,
            } => {
                let taken = branches
                    .iter()
                    .find(|(cond, _)| truthy(lookup(dot, cond)))
                    .map(|(_, body)| body);
                exec(taken.unwrap_or(otherwise), dot, out);
            }
            Node::Range {
                path,
                body,
                otherwise,
            } => {
                let items: Vec<&Value> = match lookup(dot, path) {
                    Value::Array(items) => items.iter().collect(),
                    Value::Object(map) => map.values().collect(),
                    _ => Vec::new(),
                };
                if items.is_empty() {
                    exec(otherwise, dot, out);
                }
                for item in items {
                    exec(body, item, out);
                }
            }
            Node::With {
                path,
                body,
                otherwise,
            } => {
                let value = lookup(dot, path);
                if truthy(value) {
                    exec(body, value, out);
                } else {
                    exec(otherwise, dot, out);
                }
            }
        }
    }
}

enum Token {
    Text(String),
    Action { body: String, line: usize },
}

fn line_at(source: &str, offset: usize) -> usize {
    source[..offset].matches('\n').count() + 1
}

fn lex(source: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut rest = source;
    let mut offset = 0;
    let mut trim_next = false;

    while let Some(start) = rest.find("{{") {
        let mut text = &rest[..start];
        if trim_next {
            text = text.trim_start();
        }
        let line = line_at(source, offset + start);
        let after_open = &rest[start + 2..];
        let close = match comment_start(after_open) {
            // A comment may itself contain "}}", so it ends at "*/" first.
            Some(from) => after_open[from + 2..].find("*/").and_then(|end| {
                let end = from + 2 + end;
                after_open[end..].find("}}").map(|close| end + close)
            }),
            None => after_open.find("}}"),
        };
        let Some(close) = close else {
            return Err(TemplateError::new(line, "unclosed action"));
        };

        let mut body = &after_open[..close];
        if let Some(stripped) = body.strip_prefix('-') {
            if stripped.starts_with(char::is_whitespace) {
                text = text.trim_end();
                body = stripped;
            }
        }
        trim_next = false;
        if let Some(stripped) = body.strip_suffix('-') {
            if stripped.ends_with(char::is_whitespace) {
                trim_next = true;
                body = stripped;
            }
        }

        if !text.is_empty() {
            tokens.push(Token::Text(text.to_string()));
        }
        tokens.push(Token::Action {
            body: body.trim().to_string(),
            line,
        });

        let consumed = start + 2 + close + 2;
        rest = &rest[consumed..];
        offset += consumed;
    }

    let text = if trim_next { rest.trim_start() } else { rest };
    if !text.is_empty() {
        tokens.push(Token::Text(text.to_string()));
    }
    Ok(tokens)
}

/// Offset of the `/*` opening a comment action, allowing a leading trim marker.
fn comment_start(after_open: &str) -> Option<usize> {
    if after_open.starts_with("/*") {
        return Some(0);
    }
    let rest = after_open.strip_prefix('-')?;
    let trimmed = rest.trim_start();
    (trimmed.len() < rest.len() && trimmed.starts_with("/*"))
        .then(|| after_open.len() - trimmed.len())
}

enum Action {
    Comment,
    Field(FieldPath),
    If(FieldPath),
    ElseIf(FieldPath),
    Else,
    End,
    Range(FieldPath),
    With(FieldPath),
}

fn parse_path(word: &str, line: usize) -> Result<FieldPath, TemplateError> {
    let Some(rest) = word.strip_prefix('.') else {
        return Err(TemplateError::new(
            line,
            format!("expected a field reference like .name, found {word:?}"),
        ));
    };
    if rest.is_empty() {
        return Ok(FieldPath(Vec::new()));
    }
    let segments: Vec<String> = rest.split('.').map(str::to_string).collect();
    let valid = |s: &String| !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_');
    if !segments.iter().all(valid) {
        return Err(TemplateError::new(line, format!("bad field reference {word:?}")));
    }
    Ok(FieldPath(segments))
}

fn parse_action(body: &str, line: usize) -> Result<Action, TemplateError> {
    if body.starts_with("/*") {
        return if body.len() >= 4 && body.ends_with("*/") {
            Ok(Action::Comment)
        } else {
            Err(TemplateError::new(line, "unclosed comment"))
        };
    }

    let words: Vec<&str> = body.split_whitespace().collect();
    match words.as_slice() {
        [] => Err(TemplateError::new(line, "empty action")),
        [path] if path.starts_with('.') => Ok(Action::Field(parse_path(path, line)?)),
        ["if", path] => Ok(Action::If(parse_path(path, line)?)),
        ["else"] => Ok(Action::Else),
        ["else", "if", path] => Ok(Action::ElseIf(parse_path(path, line)?)),
        ["end"] => Ok(Action::End),
        ["range", path] => Ok(Action::Range(parse_path(path, line)?)),
        ["with", path] => Ok(Action::With(parse_path(path, line)?)),
        [keyword @ ("if" | "range" | "with" | "else" | "end"), ..] => Err(TemplateError::new(
            line,
            format!("malformed {{{{{keyword}}}}} action"),
        )),
        [word, ..] => Err(TemplateError::new(
            line,
            format!("unexpected {word:?} in action"),
        )),
    }
}

enum Terminator {
    Eof,
    End(usize),
    Else(usize),
    ElseIf(FieldPath, usize),
}

struct Parser {
    tokens: std::vec::IntoIter<Token>,
    depth: usize,
}

impl Parser {
    /// Runs `parse` one block level deeper, refusing past `MAX_DEPTH`.
    fn nested<T>(
        &mut self,
        line: usize,
        parse: impl FnOnce(&mut Self) -> Result<T, TemplateError>,
    ) -> Result<T, TemplateError> {
        if self.depth >= MAX_DEPTH {
            return Err(TemplateError::new(line, "template nested too deeply"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn parse_list(&mut self) -> Result<(Vec<Node>, Terminator), TemplateError> {
        let mut nodes = Vec::new();
        while let Some(token) = self.tokens.next() {
            let (body, line) = match token {
                Token::Text(text) => {
                    nodes.push(Node::Text(text));
                    continue;
                }
                Token::Action { body, line } => (body, line),
            };
            match parse_action(&body, line)? {
                Action::Comment => {}
                Action::Field(path) => nodes.push(Node::Field(path)),
                Action::If(cond) => {
                    nodes.push(self.nested(line, |p| p.parse_if(cond, line))?);
                }
                Action::Range(path) => {
                    let (body, otherwise) =
                        self.nested(line, |p| p.parse_block("range", line))?;
                    nodes.push(Node::Range {
                        path,
                        body,
                        otherwise,
                    });
                }
                Action::With(path) => {
                    let (body, otherwise) =
                        self.nested(line, |p| p.parse_block("with", line))?;
                    nodes.push(Node::With {
                        path,
                        body,
                        otherwise,
                    });
                }
                Action::End => return Ok((nodes, Terminator::End(line))),
                Action::Else => return Ok((nodes, Terminator::Else(line))),
                Action::ElseIf(cond) => return Ok((nodes, Terminator::ElseIf(cond, line))),
            }
        }
        Ok((nodes, Terminator::Eof))
    }

    fn parse_if(&mut self, first: FieldPath, line: usize) -> Result<Node, TemplateError> {
        let mut branches = Vec::new();
        let mut cond = first;
        loop {
            let (body, end) = self.parse_list()?;
            branches.push((cond, body));
            match end {
                Terminator::End(_) => {
                    return Ok(Node::If {
                        branches,
                        otherwise: Vec::new(),
                    });
                }
                Terminator::ElseIf(next, _) => cond = next,
                Terminator::Else(_) => {
                    let otherwise = self.parse_tail("if", line)?;
                    return Ok(Node::If {
                        branches,
                        otherwise,
                    });
                }
                Terminator::Eof => return Err(missing_end("if", line)),
            }
        }
    }

    fn parse_block(
        &mut self,
        keyword: &str,
        line: usize,
    ) -> Result<(Vec<Node>, Vec<Node>), TemplateError> {
        let (body, end) = self.parse_list()?;
        match end {
            Terminator::End(_) => Ok((body, Vec::new())),
            Terminator::Else(_) => Ok((body, self.parse_tail(keyword, line)?)),
            Terminator::ElseIf(_, at) => Err(TemplateError::new(
                at,
                format!("{{{{else if}}}} is not allowed in {{{{{keyword}}}}}"),
            )),
            Terminator::Eof => Err(missing_end(keyword, line)),
        }
    }

    /// The `else` branch of a block, which must close with `end`.
    fn parse_tail(&mut self, keyword: &str, line: usize) -> Result<Vec<Node>, TemplateError> {
        let (otherwise, end) = self.parse_list()?;
        match end {
            Terminator::End(_) => Ok(otherwise),
            Terminator::Else(at) | Terminator::ElseIf(_, at) => Err(TemplateError::new(
                at,
                format!("{{{{else}}}} after {{{{else}}}} in {{{{{keyword}}}}}"),
            )),
            Terminator::Eof => Err(missing_end(keyword, line)),
        }
    }
}

fn missing_end(keyword: &str, line: usize) -> TemplateError {
    TemplateError::new(line, format!("missing {{{{end}}}} for {{{{{keyword}}}}}"))
}
