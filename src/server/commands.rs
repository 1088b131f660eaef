//! Built-in remote command catalog
//!
//! Small file-management commands over the sandboxed filesystem, plus two that
//! exercise server-initiated service requests against the client's key store.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;

use super::fs::SandboxedFs;
use super::session::{CommandContext, CommandHandler};
use crate::protocol::{CommandDescriptor, CommandOutput, ServiceRequestType};

const EXIT_FAILURE: i32 = 1;
const EXIT_UNKNOWN: i32 = 127;

const CATALOG: &[(&str, &str)] = &[
    ("help", "list available commands"),
    ("pwd", "print the working directory"),
    ("ls", "ls [path] - list a directory"),
    ("stat", "stat <path> - size and kind of an entry"),
    ("cat", "cat <path> - print a text file"),
    ("mkdir", "mkdir <path> - create a directory and its parents"),
    ("rm", "rm [-r] <path> - remove a file or directory"),
    ("mv", "mv <from> <to> - move or rename"),
    ("cp", "cp <from> <to> - copy a file"),
    ("haskey", "haskey <name> - ask the client whether it holds a key"),
    ("key", "key <name> - fetch a key from the client and report its length"),
];

pub struct BuiltinCommands {
    fs: Arc<SandboxedFs>,
}

impl BuiltinCommands {
    pub fn new(fs: Arc<SandboxedFs>) -> Self {
        Self { fs }
    }

    async fn exec(&self, ctx: &CommandContext, argv: &[String]) -> Result<String, String> {
        let args = &argv[1..];
        match argv[0].as_str() {
            "help" => {
                let mut out = String::new();
                for (name, summary) in CATALOG {
                    let _ = writeln!(out, "{name:<8} {summary}");
                }
                Ok(out)
            }
            "pwd" => Ok("/\n".to_string()),
            "ls" => {
                let target = args.first().map(String::as_str).unwrap_or("/");
                let entries = self.fs.list(target).await.map_err(|e| e.to_string())?;
                let mut out = String::new();
                for e in entries {
                    if e.is_dir {
                        let _ = writeln!(out, "{:>12}  {}/", "-", e.name);
                    } else {
                        let _ = writeln!(out, "{:>12}  {}", e.size, e.name);
                    }
                }
                Ok(out)
            }
            "stat" => {
                let [path] = one(args, "stat <path>")?;
                let meta = self.fs.metadata(path).await.map_err(|e| e.to_string())?;
                let kind = if meta.is_dir() { "directory" } else { "file" };
                Ok(format!("{path}: {kind}, {} bytes\n", meta.len()))
            }
            "cat" => {
                let [path] = one(args, "cat <path>")?;
                let data = self.fs.read(path).await.map_err(|e| e.to_string())?;
                Ok(String::from_utf8_lossy(&data).into_owned())
            }
            "mkdir" => {
                let [path] = one(args, "mkdir <path>")?;
                self.fs.create_dir(path).await.map_err(|e| e.to_string())?;
                Ok(String::new())
            }
            "rm" => {
                let (recursive, rest) = match args.first().map(String::as_str) {
                    Some("-r") | Some("-rf") => (true, &args[1..]),
                    _ => (false, args),
                };
                let [path] = one(rest, "rm [-r] <path>")?;
                let meta = self.fs.metadata(path).await.map_err(|e| e.to_string())?;
                let removed = if meta.is_dir() {
                    self.fs.remove_dir(path, recursive).await
                } else {
                    self.fs.remove_file(path).await
                };
                removed.map_err(|e| e.to_string())?;
                Ok(String::new())
            }
            "mv" => {
                let [from, to] = two(args, "mv <from> <to>")?;
                self.fs.rename(from, to).await.map_err(|e| e.to_string())?;
                Ok(String::new())
            }
            "cp" => {
                let [from, to] = two(args, "cp <from> <to>")?;
                let n = self.fs.copy(from, to).await.map_err(|e| e.to_string())?;
                Ok(format!("{n} bytes copied\n"))
            }
            "haskey" => {
                let [name] = one(args, "haskey <name>")?;
                let v = ctx
                    .service_request(ServiceRequestType::IsKeyAvailable, name)
                    .await
                    .map_err(|e| e.to_string())?;
                if v.as_bool().unwrap_or(false) {
                    Ok(format!("{name}: available\n"))
                } else {
                    Err(format!("{name}: not available"))
                }
            }
            "key" => {
                let [name] = one(args, "key <name>")?;
                let v = ctx
                    .service_request(ServiceRequestType::ReadKey, name)
                    .await
                    .map_err(|e| e.to_string())?;
                let len = v.as_str().map(str::len).unwrap_or(0);
                tracing::info!(connection = %ctx.connection_id, key = %name, "read key from client");
                Ok(format!("{name}: {len} bytes\n"))
            }
            other => Err(format!("{other}: command not found")),
        }
    }
}

fn one<'a>(args: &'a [String], usage: &str) -> Result<[&'a str; 1], String> {
    match args {
        [a] => Ok([a.as_str()]),
        _ => Err(format!("usage: {usage}")),
    }
}

fn two<'a>(args: &'a [String], usage: &str) -> Result<[&'a str; 2], String> {
    match args {
        [a, b] => Ok([a.as_str(), b.as_str()]),
        _ => Err(format!("usage: {usage}")),
    }
}

/// Split a command line on whitespace, honoring single and double quotes and
/// backslash escapes outside single quotes.
pub fn split_line(line: &str) -> Result<Vec<String>, String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => match chars.next() {
                Some(n) => {
                    cur.push(n);
                    in_word = true;
                }
                None => return Err("trailing backslash".into()),
            },
            (Some(_), c) => cur.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    out.push(std::mem::take(&mut cur));
                    in_word = false;
                }
            }
            (None, c) => {
                cur.push(c);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        return Err("unterminated quote".into());
    }
    if in_word {
        out.push(cur);
    }
    Ok(out)
}

#[async_trait]
impl CommandHandler for BuiltinCommands {
    fn catalog(&self) -> Vec<CommandDescriptor> {
        CATALOG
            .iter()
            .map(|(name, summary)| CommandDescriptor {
                name: name.to_string(),
                summary: summary.to_string(),
            })
            .collect()
    }

    async fn run(&self, ctx: &CommandContext, line: &str) -> CommandOutput {
        let argv = match split_line(line) {
            Ok(argv) if !argv.is_empty() => argv,
            Ok(_) => return CommandOutput::default(),
            Err(e) => {
                return CommandOutput {
                    exit_code: EXIT_FAILURE,
                    output: format!("{e}\n"),
                }
            }
        };
        let known = CATALOG.iter().any(|(name, _)| *name == argv[0]);
        tracing::debug!(connection = %ctx.connection_id, subject = %ctx.subject, command = %argv[0], "run command");
        match self.exec(ctx, &argv).await {
            Ok(output) => CommandOutput { exit_code: 0, output },
            Err(msg) => CommandOutput {
                exit_code: if known { EXIT_FAILURE } else { EXIT_UNKNOWN },
                output: format!("{msg}\n"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::sandbox::PathSandbox;
    use crate::server::session::ConnectionHub;
    use crate::server::validators::{ExtensionValidator, SizeValidator, WriteGate};

    fn setup(dir: &std::path::Path) -> (BuiltinCommands, CommandContext) {
        let sandbox = PathSandbox::new(dir).unwrap();
        let gate = WriteGate::new(SizeValidator::new(0), ExtensionValidator::new(["txt"]));
        let fs = Arc::new(SandboxedFs::new(sandbox, gate));
        let ctx = CommandContext::new("c1", "anonymous", Arc::new(ConnectionHub::new()));
        (BuiltinCommands::new(fs), ctx)
    }

    #[test]
    fn test_split_line() {
        assert_eq!(split_line("ls  /a").unwrap(), ["ls", "/a"]);
        assert_eq!(split_line(r#"mv "my file.txt" 'b c.txt'"#).unwrap(), ["mv", "my file.txt", "b c.txt"]);
        assert_eq!(split_line(r"cat a\ b").unwrap(), ["cat", "a b"]);
        assert_eq!(split_line(r#"x """#).unwrap(), ["x", ""]);
        assert!(split_line("cat 'oops").is_err());
        assert!(split_line("   ").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_commands() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let (cmds, ctx) = setup(dir.path());

        let out = cmds.run(&ctx, "cat /a.txt").await;
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.output, "hello");

        assert_eq!(cmds.run(&ctx, "mkdir sub/deep").await.exit_code, 0);
        assert_eq!(cmds.run(&ctx, "cp a.txt sub/b.txt").await.exit_code, 0);
        assert_eq!(std::fs::read(dir.path().join("sub/b.txt")).unwrap(), b"hello");

        let ls = cmds.run(&ctx, "ls").await;
        assert!(ls.output.contains("a.txt"));
        assert!(ls.output.contains("sub/"));

        // the extension allowlist applies to copies too
        let denied = cmds.run(&ctx, "cp a.txt a.exe").await;
        assert_eq!(denied.exit_code, EXIT_FAILURE);
        assert!(denied.output.contains("extension"));

        assert_eq!(cmds.run(&ctx, "rm sub").await.exit_code, EXIT_FAILURE);
        assert_eq!(cmds.run(&ctx, "rm -r sub").await.exit_code, 0);
        assert!(!dir.path().join("sub").exists());
    }

    #[tokio::test]
    async fn test_escape_and_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let (cmds, ctx) = setup(dir.path());
        let out = cmds.run(&ctx, "cat ../../etc/passwd").await;
        assert_eq!(out.exit_code, EXIT_FAILURE);
        assert!(out.output.contains("access denied"));

        let out = cmds.run(&ctx, "frobnicate").await;
        assert_eq!(out.exit_code, EXIT_UNKNOWN);

        assert_eq!(cmds.run(&ctx, "rm -r /").await.exit_code, EXIT_FAILURE);
        assert_eq!(cmds.run(&ctx, "stat").await.output, "usage: stat <path>\n");
    }

    #[tokio::test]
    async fn test_key_command_without_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (cmds, ctx) = setup(dir.path());
        // no live connection behind the context
        assert_eq!(cmds.run(&ctx, "haskey deploy").await.exit_code, EXIT_FAILURE);
        assert_eq!(cmds.catalog().len(), CATALOG.len());
    }
}
