//! Line-level grub configuration editing.
//!
//! Grub configs are treated as lines of whitespace separated tokens. A line
//! is a command when its first token is the command name. Lines that are not
//! touched are emitted byte-for-byte; edited lines keep their indentation and
//! have their tokens re-joined with single spaces.

pub mod rewrite;

use anyhow::Result;

use crate::error::LiveOsError;

pub const LINUX_COMMANDS: &[&str] = &["linux", "linuxefi", "linux16"];
pub const INITRD_COMMANDS: &[&str] = &["initrd", "initrdefi", "initrd16"];
pub const SEARCH_COMMAND: &str = "search";

/// Headers written by `grub2-mkconfig`.
const MKCONFIG_MARKERS: &[&str] = &["### BEGIN /etc/grub.d/", "generated by grub2-mkconfig"];

/// Whether the config was generated by `grub2-mkconfig`.
pub fn is_mkconfig_config(content: &str) -> bool {
    MKCONFIG_MARKERS.iter().any(|marker| content.contains(marker))
}

fn split_indent(line: &str) -> (&str, &str) {
    let body = line.trim_start();
    (&line[..line.len() - body.len()], body)
}

fn is_command(body: &str, commands: &[&str]) -> bool {
    body.split_whitespace()
        .next()
        .is_some_and(|first| commands.contains(&first))
}

/// Apply `edit` to the tokens of every line whose command is in `commands`.
///
/// `edit` returns whether it changed anything. Returns the new content and
/// the number of matching lines.
fn edit_command_lines<F>(content: &str, commands: &[&str], mut edit: F) -> (String, usize)
where
    F: FnMut(&mut Vec<String>) -> bool,
{
    let mut matched = 0;
    let lines: Vec<String> = content
        .split('\n')
        .map(|line| {
            let (indent, body) = split_indent(line);
            if !is_command(body, commands) {
                return line.to_string();
            }
            matched += 1;
            let mut tokens: Vec<String> = body.split_whitespace().map(str::to_string).collect();
            if edit(&mut tokens) {
                format!("{}{}", indent, tokens.join(" "))
            } else {
                line.to_string()
            }
        })
        .collect();
    (lines.join("\n"), matched)
}

/// Replace every `search` command with `replacement`. No-op when none exist.
pub fn replace_search_commands(content: &str, replacement: &str) -> String {
    let replacement: Vec<String> = replacement.split_whitespace().map(str::to_string).collect();
    edit_command_lines(content, &[SEARCH_COMMAND], |tokens| {
        *tokens = replacement.clone();
        true
    })
    .0
}

/// Drop every line running `command`.
pub fn remove_commands(content: &str, command: &str) -> String {
    content
        .split('\n')
        .filter(|line| !is_command(split_indent(line).1, &[command]))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Point the first `commands` line at `new_path`, returning the path it had.
pub fn set_first_path(content: &str, commands: &[&str], new_path: &str) -> Result<(String, String)> {
    let mut old_path = None;
    let (content, _) = edit_command_lines(content, commands, |tokens| {
        if old_path.is_some() || tokens.len() < 2 {
            return false;
        }
        old_path = Some(std::mem::replace(&mut tokens[1], new_path.to_string()));
        true
    });
    match old_path {
        Some(old) => Ok((content, old)),
        None => Err(LiveOsError::GrubCommandNotFound {
            command: commands[0].to_string(),
        }
        .into()),
    }
}

/// Point every `commands` line at `new_path`.
pub fn set_all_paths(content: &str, commands: &[&str], new_path: &str) -> Result<String> {
    let mut updated = 0;
    let (content, _) = edit_command_lines(content, commands, |tokens| {
        if tokens.len() < 2 {
            return false;
        }
        tokens[1] = new_path.to_string();
        updated += 1;
        true
    });
    if updated == 0 {
        return Err(LiveOsError::GrubCommandNotFound {
            command: commands[0].to_string(),
        }
        .into());
    }
    Ok(content)
}

/// Replace every whitespace-delimited token equal to `old` with `new`.
///
/// Whole-token matching keeps `/boot/vmlinuz` from being rewritten inside an
/// already-rewritten `/boot/vmlinuz-old` and vice versa.
pub fn replace_token(content: &str, old: &str, new: &str) -> String {
    content
        .split('\n')
        .map(|line| {
            if !line.split_whitespace().any(|t| t == old) {
                return line.to_string();
            }
            let (indent, body) = split_indent(line);
            let tokens: Vec<&str> = body
                .split_whitespace()
                .map(|t| if t == old { new } else { t })
                .collect();
            format!("{}{}", indent, tokens.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Set `name=value` on every kernel command line that already has `name=`.
pub fn replace_kernel_arg_all(content: &str, name: &str, value: &str) -> Result<String> {
    let prefix = format!("{}=", name);
    let mut replaced = 0;
    let (content, _) = edit_command_lines(content, LINUX_COMMANDS, |tokens| {
        let mut changed = false;
        for token in tokens.iter_mut().skip(2) {
            if token.starts_with(&prefix) {
                *token = format!("{}{}", prefix, value);
                replaced += 1;
                changed = true;
            }
        }
        changed
    });
    if replaced == 0 {
        return Err(LiveOsError::KernelArgNotFound {
            arg: name.to_string(),
        }
        .into());
    }
    Ok(content)
}

/// Force SELinux off on every kernel command line.
pub fn disable_selinux_all(content: &str) -> Result<String> {
    let (content, matched) = edit_command_lines(content, LINUX_COMMANDS, |tokens| {
        let keep = tokens.len().min(2);
        let mut args: Vec<String> = tokens
            .drain(keep..)
            .filter(|t| !t.starts_with("selinux=") && !t.starts_with("enforcing="))
            .collect();
        args.push("selinux=0".to_string());
        tokens.append(&mut args);
        true
    });
    if matched == 0 {
        return Err(LiveOsError::GrubCommandNotFound {
            command: LINUX_COMMANDS[0].to_string(),
        }
        .into());
    }
    Ok(content)
}

/// Append `args` to every kernel command line.
pub fn append_kernel_args_all(content: &str, args: &str) -> Result<String> {
    let extra: Vec<String> = args.split_whitespace().map(str::to_string).collect();
    let (content, matched) = edit_command_lines(content, LINUX_COMMANDS, |tokens| {
        tokens.extend(extra.iter().cloned());
        !extra.is_empty()
    });
    if matched == 0 {
        return Err(LiveOsError::GrubCommandNotFound {
            command: LINUX_COMMANDS[0].to_string(),
        }
        .into());
    }
    Ok(content)
}
