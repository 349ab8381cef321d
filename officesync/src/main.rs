//! Entry point for the officesync viewer. Parses args, resolves the
//! connection profile and prints the daemon's stream one message per line.

use std::env;
use std::io::{self, Write};
use std::time::Duration;

use officesync::profiles::{validate_url, ProfileEntry, ProfileRequest, ProfilesFile, ResolveProfile};
use officesync::types::Incoming;
use officesync::ws;

const USAGE: &str = "[--profile NAME|-P NAME] [--save] [--agent ID|-a ID] [--subscribe CHANNEL] [--ping] [--dry-run] [ws://HOST:PORT/ws]";
const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct ParsedArgs {
    url: Option<String>,
    profile: Option<String>,
    agent: Option<String>,
    subscribe: Option<String>,
    save: bool,
    ping: bool,
    dry_run: bool,
}

enum Parsed {
    Run(ParsedArgs),
    Help(String),
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Parsed, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "officesync".into());
    let mut out = ParsedArgs::default();

    while let Some(arg) = it.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) if f.starts_with("--") => (f.to_string(), Some(v.to_string())),
            _ => (arg.clone(), None),
        };
        let mut value = |name: &str| {
            inline
                .clone()
                .or_else(|| it.next())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| format!("{name} needs a value. Usage: {prog} {USAGE}"))
        };
        match flag.as_str() {
            "-h" | "--help" => return Ok(Parsed::Help(format!("Usage: {prog} {USAGE}"))),
            "--profile" | "-P" => out.profile = Some(value("--profile")?),
            "--agent" | "-a" => out.agent = Some(value("--agent")?),
            "--subscribe" => out.subscribe = Some(value("--subscribe")?),
            "--save" => out.save = true,
            "--ping" => out.ping = true,
            "--dry-run" => out.dry_run = true,
            _ if arg.starts_with('-') => {
                return Err(format!("Unknown flag {arg}. Usage: {prog} {USAGE}"));
            }
            _ => {
                if out.url.is_some() {
                    return Err(format!("Unexpected argument. Usage: {prog} {USAGE}"));
                }
                out.url = Some(arg);
            }
        }
    }
    Ok(Parsed::Run(out))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = match parse_args(env::args()) {
        Ok(Parsed::Run(p)) => p,
        Ok(Parsed::Help(usage)) => {
            println!("{usage}");
            return Ok(());
        }
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let Some((url, agent)) = resolve_connection(&parsed)? else {
        return Ok(());
    };
    if let Err(e) = validate_url(&url) {
        eprintln!("{e}");
        std::process::exit(2);
    }

    if parsed.dry_run {
        println!("{url}");
        return Ok(());
    }

    let mut stream = ws::connect(&url).await?;
    if parsed.ping {
        let rtt = ws::ping(&mut stream, PING_TIMEOUT).await?;
        println!("pong from {url} in {} ms", rtt.as_millis());
        return Ok(());
    }
    if let Some(channel) = parsed.subscribe.as_deref() {
        ws::subscribe(&mut stream, channel).await?;
    }
    if let Some(agent) = agent.as_deref() {
        ws::request_agent_status(&mut stream, agent).await?;
    }

    loop {
        tokio::select! {
            msg = ws::next_message(&mut stream) => match msg {
                Some(Ok((raw, Incoming::Envelope(_)))) => println!("{raw}"),
                Some(Ok((raw, _))) => eprintln!("{raw}"),
                Some(Err(e)) => eprintln!("skipping message: {e}"),
                None => {
                    eprintln!("connection closed by daemon");
                    return Ok(());
                }
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

/// Work out the URL (and agent) to use, saving or prompting for profiles the
/// way the flags ask. `None` means the user aborted.
fn resolve_connection(parsed: &ParsedArgs) -> anyhow::Result<Option<(String, Option<String>)>> {
    let profiles_file = ProfilesFile::load();
    let req = ProfileRequest {
        profile_name: parsed.profile.clone(),
        url: parsed.url.clone(),
        agent: parsed.agent.clone(),
    };
    let mut profiles_mut = profiles_file.clone();
    let resolved = match req.resolve(&profiles_file) {
        ResolveProfile::Direct(u, a) => {
            validate_url(&u).map_err(anyhow::Error::msg)?;
            // Possibly save if profile specified and --save or new entry
            if let Some(name) = parsed.profile.as_ref() {
                let entry = ProfileEntry {
                    url: u.clone(),
                    agent: a.clone(),
                };
                let write = match profiles_mut.profiles.get(name) {
                    None => true,
                    Some(existing) if *existing == entry => false,
                    Some(_) => {
                        parsed.save
                            || prompt_yes_no(&format!("Overwrite existing profile '{name}'? [y/N]: "))
                    }
                };
                if write {
                    profiles_mut.profiles.insert(name.clone(), entry);
                    if let Err(e) = profiles_mut.save() {
                        eprintln!("could not save profile '{name}': {e}");
                    }
                }
            }
            (u, a)
        }
        ResolveProfile::Loaded(u, a) => (u, a),
        ResolveProfile::PromptSelect(names) => {
            eprintln!("Select profile:");
            for (i, n) in names.iter().enumerate() {
                eprintln!("  {}. {}", i + 1, n);
            }
            let line = prompt_string("Enter number (or blank to abort): ")?;
            let picked = line
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| names.get(i))
                .and_then(|n| profiles_mut.profiles.get(n));
            match picked {
                Some(entry) => (entry.url.clone(), parsed.agent.clone().or(entry.agent.clone())),
                None => return Ok(None),
            }
        }
        ResolveProfile::PromptCreate(name) => {
            eprintln!("Profile '{name}' does not exist yet.");
            let url = prompt_string("Enter URL (ws://HOST:PORT/ws or wss://...): ")?;
            let url = url.trim().to_string();
            if url.is_empty() {
                return Ok(None);
            }
            profiles_mut.profiles.insert(
                name.clone(),
                ProfileEntry {
                    url: url.clone(),
                    agent: parsed.agent.clone(),
                },
            );
            if let Err(e) = profiles_mut.save() {
                eprintln!("could not save profile '{name}': {e}");
            }
            (url, parsed.agent.clone())
        }
        ResolveProfile::None => {
            eprintln!("No URL provided and no profiles to select.");
            return Ok(None);
        }
    };
    Ok(Some(resolved))
}

fn prompt_yes_no(prompt: &str) -> bool {
    eprint!("{prompt}");
    let _ = io::stderr().flush();
    let mut line = String::new();
    if io::stdin().read_line(&mut line).is_ok() {
        matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    } else {
        false
    }
}

fn prompt_string(prompt: &str) -> io::Result<String> {
    eprint!("{prompt}");
    let _ = io::stderr().flush();
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(v: &[&str]) -> Result<Parsed, String> {
        parse_args(std::iter::once("officesync").chain(v.iter().copied()).map(String::from))
    }

    #[test]
    fn flags_short_long_and_assign() {
        let Ok(Parsed::Run(p)) = parse(&["-P", "lab", "--agent=scout", "--ping", "ws://h:1/ws"]) else {
            panic!("expected run");
        };
        assert_eq!(p.profile.as_deref(), Some("lab"));
        assert_eq!(p.agent.as_deref(), Some("scout"));
        assert!(p.ping && !p.save && !p.dry_run);
        assert_eq!(p.url.as_deref(), Some("ws://h:1/ws"));

        assert!(matches!(parse(&["--help"]), Ok(Parsed::Help(_))));
        assert!(parse(&["--agent"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
        assert!(parse(&["ws://a/ws", "ws://b/ws"]).is_err());
    }
}
