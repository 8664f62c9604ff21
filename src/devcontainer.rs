//! devcontainer.json parsing.
//!
//! Resolves a workspace's devcontainer file into the [`ContainerSpec`] and
//! lifecycle hooks the host agent runs. Paths in the file are relative to
//! the file; the resolved spec holds paths relative to the source root.

use kled_protocol::{BuildSpec, ContainerSpec, HookCommand, HookPhase, HookSpec, MountSpec};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Files probed when the workspace names none, in order.
pub const DEFAULT_LOCATIONS: [&str; 2] = [".devcontainer/devcontainer.json", ".devcontainer.json"];

/// A resolved devcontainer configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevContainer {
    pub container: ContainerSpec,
    pub hooks: Vec<HookSpec>,
}

/// Find the devcontainer file under `root`.
///
/// `explicit` is relative to `root` and must exist when given.
pub fn locate(root: &Path, explicit: Option<&str>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        let full = root.join(path);
        if !full.is_file() {
            return Err(Error::config(format!(
                "devcontainer file not found: {}",
                full.display()
            )));
        }
        return Ok(Some(PathBuf::from(path)));
    }
    Ok(DEFAULT_LOCATIONS
        .iter()
        .map(PathBuf::from)
        .find(|p| root.join(p).is_file()))
}

/// Load and resolve the devcontainer file at `root/relative`.
pub fn load(root: &Path, relative: &Path) -> Result<DevContainer> {
    let full = root.join(relative);
    let text = std::fs::read_to_string(&full)
        .map_err(|e| Error::config(format!("failed to read {}: {}", full.display(), e)))?;
    let base = relative.parent().unwrap_or(Path::new(""));
    parse(&text, base)
        .map_err(|e| Error::config(format!("invalid {}: {}", relative.display(), e)))
}

/// Parse devcontainer JSON. `base` is the file's directory relative to the
/// source root.
pub fn parse(text: &str, base: &Path) -> std::result::Result<DevContainer, String> {
    let value: Value =
        serde_json::from_str(&strip_jsonc(text)).map_err(|e| e.to_string())?;
    let Value::Object(root) = value else {
        return Err("expected a JSON object".into());
    };

    let build = parse_build(&root, base)?;
    if build.image.is_none() && build.dockerfile.is_none() {
        return Err("neither 'image' nor 'build.dockerfile' is set".into());
    }

    let container = ContainerSpec {
        build,
        mounts: parse_mounts(root.get("mounts"))?,
        env: string_map(root.get("containerEnv")),
        user: str_field(&root, "remoteUser").or_else(|| str_field(&root, "containerUser")),
        workspace_folder: str_field(&root, "workspaceFolder"),
    };

    Ok(DevContainer {
        container,
        hooks: parse_hooks(&root)?,
    })
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let Some(Value::Object(map)) = value else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(k, v)| match v {
            Value::String(s) => Some((k.clone(), s.clone())),
            Value::Number(n) => Some((k.clone(), n.to_string())),
            Value::Bool(b) => Some((k.clone(), b.to_string())),
            _ => None,
        })
        .collect()
}

fn parse_build(root: &Map<String, Value>, base: &Path) -> std::result::Result<BuildSpec, String> {
    let build = root.get("build").and_then(Value::as_object);
    let lookup = |key: &str| {
        build
            .and_then(|b| b.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let dockerfile = lookup("dockerfile")
        .or_else(|| lookup("dockerFile"))
        .or_else(|| str_field(root, "dockerFile"));
    let context = lookup("context").or_else(|| str_field(root, "context"));

    let resolve = |p: &str| -> std::result::Result<String, String> {
        normalize(&base.join(p))
            .map(|p| p.to_string_lossy().into_owned())
            .ok_or_else(|| format!("path '{}' escapes the workspace source", p))
    };

    let (dockerfile, context) = match dockerfile {
        Some(file) => {
            let context = resolve(context.as_deref().unwrap_or("."))?;
            (Some(resolve(&file)?), Some(context))
        }
        None => (None, None),
    };

    Ok(BuildSpec {
        image: str_field(root, "image"),
        dockerfile,
        context,
        args: string_map(build.and_then(|b| b.get("args"))),
        target: lookup("target"),
    })
}

/// Resolve `.` and `..` lexically. `None` if the path climbs above its root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    Some(out)
}

fn parse_mounts(value: Option<&Value>) -> std::result::Result<Vec<MountSpec>, String> {
    let Some(Value::Array(items)) = value else {
        return Ok(Vec::new());
    };
    items
        .iter()
        .map(|item| match item {
            Value::String(s) => parse_mount_string(s),
            Value::Object(obj) => {
                let source = str_field(obj, "source").unwrap_or_default();
                let target = str_field(obj, "target").unwrap_or_default();
                if source.is_empty() || target.is_empty() {
                    return Err(format!("mount needs source and target: {}", item));
                }
                Ok(MountSpec {
                    source,
                    target,
                    read_only: obj.get("readonly").and_then(Value::as_bool).unwrap_or(false),
                })
            }
            other => Err(format!("unsupported mount: {}", other)),
        })
        .collect()
}

/// `source=a,target=b[,readonly]` (docker `--mount` syntax) or `a:b[:ro]`.
fn parse_mount_string(spec: &str) -> std::result::Result<MountSpec, String> {
    if !spec.contains('=') {
        return MountSpec::parse(spec).ok_or_else(|| format!("invalid mount '{}'", spec));
    }

    let mut source = None;
    let mut target = None;
    let mut read_only = false;
    for part in spec.split(',') {
        match part.split_once('=') {
            Some(("source" | "src", v)) => source = Some(v.to_string()),
            Some(("target" | "dst" | "destination", v)) => target = Some(v.to_string()),
            Some(("readonly" | "ro", v)) => read_only = v != "false",
            None if part == "readonly" || part == "ro" => read_only = true,
            _ => {}
        }
    }
    match (source, target) {
        (Some(source), Some(target)) => Ok(MountSpec {
            source,
            target,
            read_only,
        }),
        _ => Err(format!("mount needs source and target: '{}'", spec)),
    }
}

fn parse_hooks(root: &Map<String, Value>) -> std::result::Result<Vec<HookSpec>, String> {
    let required: Vec<String> = root
        .get("customizations")
        .and_then(|c| c.get("kled"))
        .and_then(|k| k.get("requiredHooks"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let is_required = |phase: HookPhase, name: &str| {
        required
            .iter()
            .any(|r| r == phase.property() || r == name)
    };

    let mut hooks = Vec::new();
    for phase in HookPhase::ALL {
        let Some(value) = root.get(phase.property()) else {
            continue;
        };
        let mut push = |name: String, command: HookCommand| {
            hooks.push(HookSpec {
                required: is_required(phase, &name),
                name,
                phase,
                command,
            });
        };
        match value {
            Value::Null => {}
            Value::String(_) | Value::Array(_) => {
                push(phase.property().to_string(), hook_command(value)?);
            }
            // named commands run in key order
            Value::Object(named) => {
                for (name, command) in named {
                    push(name.clone(), hook_command(command)?);
                }
            }
            other => return Err(format!("invalid {}: {}", phase.property(), other)),
        }
    }
    Ok(hooks)
}

fn hook_command(value: &Value) -> std::result::Result<HookCommand, String> {
    match value {
        Value::String(cmd) => Ok(HookCommand::Shell(cmd.clone())),
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| format!("hook arguments must be strings: {}", value))
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(HookCommand::Exec),
        other => Err(format!("invalid hook command: {}", other)),
    }
}

/// Strip `//` and `/* */` comments and trailing commas.
fn strip_jsonc(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }

    remove_trailing_commas(&out)
}

fn remove_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
            out.push(c);
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
            if !matches!(next, Some('}') | Some(']')) {
                out.push(c);
            }
        } else {
            out.push(c);
        }
        i += 1;
    }
    out
}
