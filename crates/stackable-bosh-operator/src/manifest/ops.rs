//! Ops files: ordered patches applied to a manifest.
//!
//! An ops file is a YAML list of `replace` and `remove` operations addressing a node by path.
//! Path tokens are separated by `/` and address a map key, an array index, the end of an array
//! (`-`), or the array element whose `key` equals `value` (`key=value`). A token ending in `?`
//! makes it and all following tokens optional: missing nodes are created by `replace` and
//! ignored by `remove`. `~1` and `~0` escape `/` and `~` inside a token.
//!
//! Array element tokens (indices, negative indices counting from the end, and matchers) take
//! modifiers after a `:`. `:prev` and `:next` step to the neighbouring element, `:before` and
//! `:after` make a `replace` insert its value next to the element instead of overwriting it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use snafu::{ResultExt, Snafu};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse ops file"))]
    Parse { source: serde_yaml::Error },

    #[snafu(display("operation {index} has an invalid path {path:?}: {reason}"))]
    InvalidPath {
        index: usize,
        path: String,
        reason: String,
    },

    #[snafu(display("operation {index} ({operation}): {node} does not exist"))]
    NotFound {
        index: usize,
        operation: String,
        node: String,
    },
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    Replace { path: String, value: Value },
    Remove { path: String },
}

impl Operation {
    pub fn path(&self) -> &str {
        match self {
            Self::Replace { path, .. } | Self::Remove { path } => path,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replace { path, .. } => write!(f, "replace {path}"),
            Self::Remove { path } => write!(f, "remove {path}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Modifier {
    Prev,
    Next,
    Before,
    After,
}

impl Modifier {
    fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "prev" => Ok(Self::Prev),
            "next" => Ok(Self::Next),
            "before" => Ok(Self::Before),
            "after" => Ok(Self::After),
            other => Err(format!("unknown modifier {other:?}")),
        }
    }

    /// Offset from the addressed element at which `:before` and `:after` insert.
    fn insertion_offset(self) -> Option<usize> {
        match self {
            Self::Before => Some(0),
            Self::After => Some(1),
            Self::Prev | Self::Next => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Selector {
    Index(isize),
    Matcher { key: String, value: String },
}

impl Selector {
    fn position(&self, items: &[Value]) -> Option<usize> {
        match self {
            Self::Index(index) => {
                let index = if *index < 0 {
                    items.len().checked_sub(index.unsigned_abs())?
                } else {
                    index.unsigned_abs()
                };
                (index < items.len()).then_some(index)
            }
            Self::Matcher { key, value } => items
                .iter()
                .position(|item| scalar_matches(item, key, value)),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Token {
    Key {
        name: String,
        optional: bool,
    },
    Append,
    Element {
        selector: Selector,
        modifiers: Vec<Modifier>,
        optional: bool,
    },
}

impl Token {
    /// An empty node this token can address into.
    fn empty_container(&self) -> Value {
        match self {
            Self::Key { .. } => Value::Mapping(Mapping::new()),
            Self::Append | Self::Element { .. } => Value::Sequence(Vec::new()),
        }
    }

    fn inserts(&self) -> bool {
        match self {
            Self::Element { modifiers, .. } => modifiers
                .last()
                .is_some_and(|modifier| modifier.insertion_offset().is_some()),
            Self::Key { .. } | Self::Append => false,
        }
    }
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn parse_modifiers(list: &str) -> Result<Vec<Modifier>, String> {
    list.split(':').map(Modifier::parse).collect()
}

fn parse_token(raw: &str, optional: bool, last: bool) -> Result<Token, String> {
    if raw.is_empty() {
        return Err("empty path token".to_owned());
    }
    if raw == "-" {
        return Ok(Token::Append);
    }

    let (base, modifier_list) = match raw.split_once(':') {
        Some((base, list)) => (base, Some(list)),
        None => (raw, None),
    };
    let selector = if let Ok(index) = base.parse() {
        Selector::Index(index)
    } else if let Some((key, value)) = base.split_once('=') {
        Selector::Matcher {
            key: unescape(key),
            value: unescape(value),
        }
    } else {
        // Keys may contain colons, unless what follows reads as modifiers.
        if modifier_list.is_some_and(|list| parse_modifiers(list).is_ok()) {
            return Err(format!(
                "modifiers only apply to array elements, not key {base:?}"
            ));
        }
        return Ok(Token::Key {
            name: unescape(raw),
            optional,
        });
    };

    let modifiers = modifier_list
        .map(parse_modifiers)
        .transpose()?
        .unwrap_or_default();
    let insertion = modifiers
        .iter()
        .position(|modifier| modifier.insertion_offset().is_some());
    if insertion.is_some_and(|position| position + 1 != modifiers.len() || !last) {
        return Err("`:before` and `:after` must end the path".to_owned());
    }
    Ok(Token::Element {
        selector,
        modifiers,
        optional,
    })
}

fn parse_path(path: &str) -> Result<Vec<Token>, String> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err("paths must start with /".to_owned());
    };
    if rest.is_empty() {
        return Ok(Vec::new());
    }

    let raw_tokens: Vec<_> = rest.split('/').collect();
    let mut optional = false;
    raw_tokens
        .iter()
        .enumerate()
        .map(|(position, raw)| {
            let raw = match raw.strip_suffix('?') {
                Some(raw) => {
                    optional = true;
                    raw
                }
                None => raw,
            };
            parse_token(raw, optional, position + 1 == raw_tokens.len())
        })
        .collect()
}

/// Steps from `position` through the `:prev` and `:next` modifiers.
fn step(position: usize, modifiers: &[Modifier], len: usize) -> Option<usize> {
    modifiers.iter().try_fold(position, |position, modifier| {
        let next = match modifier {
            Modifier::Prev => position.checked_sub(1)?,
            Modifier::Next => position + 1,
            Modifier::Before | Modifier::After => position,
        };
        (next < len).then_some(next)
    })
}

enum Action<'a> {
    Replace(&'a Value),
    Remove,
}

/// How an operation touched the manifest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Applied {
    Matched,

    /// An optional node was missing and has been created.
    Created,

    /// An optional node was missing and the operation did nothing.
    Ignored,
}

impl Applied {
    fn or_created(self, created: bool) -> Self {
        if created && self == Self::Matched {
            Self::Created
        } else {
            self
        }
    }
}

/// The number of leading tokens that did resolve before a node was missing.
struct Missing(usize);

fn scalar_matches(node: &Value, key: &str, expected: &str) -> bool {
    match node.get(key) {
        Some(Value::String(actual)) => actual == expected,
        Some(Value::Number(actual)) => actual.to_string() == expected,
        Some(Value::Bool(actual)) => actual.to_string() == expected,
        _ => false,
    }
}

fn walk(node: &mut Value, tokens: &[Token], action: &Action, depth: usize) -> Result<Applied, Missing> {
    let Some((token, rest)) = tokens.split_first() else {
        return match action {
            Action::Replace(value) => {
                *node = (*value).clone();
                Ok(Applied::Matched)
            }
            Action::Remove => Err(Missing(depth)),
        };
    };
    let last = rest.is_empty();

    match token {
        Token::Key { name, optional } => {
            let Value::Mapping(map) = node else {
                return Err(Missing(depth));
            };
            let key = Value::String(name.clone());
            if last {
                return match action {
                    Action::Replace(value) => {
                        let existed = map.insert(key, (*value).clone()).is_some();
                        match (existed, optional) {
                            (true, _) => Ok(Applied::Matched),
                            (false, true) => Ok(Applied::Created),
                            (false, false) => {
                                map.remove(name.as_str());
                                Err(Missing(depth))
                            }
                        }
                    }
                    Action::Remove => match (map.remove(name.as_str()), optional) {
                        (Some(_), _) => Ok(Applied::Matched),
                        (None, true) => Ok(Applied::Ignored),
                        (None, false) => Err(Missing(depth)),
                    },
                };
            }

            let mut created = false;
            if !map.contains_key(name.as_str()) {
                match (action, optional) {
                    (_, false) => return Err(Missing(depth)),
                    (Action::Remove, true) => return Ok(Applied::Ignored),
                    (Action::Replace(_), true) => {
                        map.insert(key.clone(), rest[0].empty_container());
                        created = true;
                    }
                }
            }
            let child = map.get_mut(name.as_str()).ok_or(Missing(depth))?;
            Ok(walk(child, rest, action, depth + 1)?.or_created(created))
        }

        Token::Append => {
            let (Value::Sequence(items), Action::Replace(value), true) = (node, action, last) else {
                return Err(Missing(depth));
            };
            items.push((*value).clone());
            Ok(Applied::Matched)
        }

        Token::Element {
            selector,
            modifiers,
            optional,
        } => {
            let Value::Sequence(items) = node else {
                return Err(Missing(depth));
            };
            let position = selector
                .position(items)
                .and_then(|position| step(position, modifiers, items.len()));
            let insertion = modifiers.last().and_then(|modifier| modifier.insertion_offset());

            match (position, action, last) {
                (Some(position), Action::Replace(value), true) => {
                    match insertion {
                        Some(offset) => items.insert(position + offset, (*value).clone()),
                        None => items[position] = (*value).clone(),
                    }
                    Ok(Applied::Matched)
                }
                (Some(position), Action::Remove, true) => {
                    items.remove(position);
                    Ok(Applied::Matched)
                }
                (Some(position), _, false) => walk(&mut items[position], rest, action, depth + 1),
                (None, _, _) if !optional => Err(Missing(depth)),
                (None, Action::Remove, _) => Ok(Applied::Ignored),
                // Only plain matchers describe an element that can be created.
                (None, Action::Replace(_), _) if !modifiers.is_empty() => Err(Missing(depth)),
                (None, Action::Replace(value), true) => match selector {
                    Selector::Matcher { .. } => {
                        items.push((*value).clone());
                        Ok(Applied::Created)
                    }
                    Selector::Index(_) => Err(Missing(depth)),
                },
                (None, Action::Replace(_), false) => match selector {
                    Selector::Matcher { key, value } => {
                        let mut element = Mapping::new();
                        element.insert(key.as_str().into(), value.as_str().into());
                        items.push(Value::Mapping(element));
                        let child = items.last_mut().ok_or(Missing(depth))?;
                        Ok(walk(child, rest, action, depth + 1)?.or_created(true))
                    }
                    Selector::Index(_) => Err(Missing(depth)),
                },
            }
        }
    }
}

/// Renders the first `depth + 1` tokens of `path`.
fn node_name(path: &str, depth: usize) -> String {
    let tokens: Vec<_> = path.trim_start_matches('/').split('/').take(depth + 1).collect();
    format!("/{}", tokens.join("/"))
}

/// Parses an ops file.
pub fn parse(input: &str) -> Result<Vec<Operation>> {
    serde_yaml::from_str::<Option<Vec<Operation>>>(input)
        .map(Option::unwrap_or_default)
        .context(ParseSnafu)
}

/// Applies `operations` to `target` in order.
///
/// Returns a warning for every optional path that matched nothing.
pub fn apply(target: &mut Value, operations: &[Operation]) -> Result<Vec<String>> {
    let mut warnings = Vec::new();
    for (index, operation) in operations.iter().enumerate() {
        let path = operation.path();
        let tokens = parse_path(path).map_err(|reason| Error::InvalidPath {
            index,
            path: path.to_owned(),
            reason,
        })?;
        let action = match operation {
            Operation::Replace { value, .. } => Action::Replace(value),
            Operation::Remove { .. } => Action::Remove,
        };
        if matches!(action, Action::Remove) && tokens.last().is_some_and(Token::inserts) {
            return InvalidPathSnafu {
                index,
                path,
                reason: "`:before` and `:after` only apply to replace",
            }
            .fail();
        }

        match walk(target, &tokens, &action, 0) {
            Ok(Applied::Matched) => {}
            Ok(Applied::Created | Applied::Ignored) => {
                warnings.push(format!(
                    "optional path {path} of operation {index} matched nothing"
                ));
            }
            Err(Missing(depth)) => {
                return NotFoundSnafu {
                    index,
                    operation: operation.to_string(),
                    node: node_name(path, depth),
                }
                .fail();
            }
        }
    }
    Ok(warnings)
}
