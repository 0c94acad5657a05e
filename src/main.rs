//!
//! dam operator binary
//! -------------------
//! Administers a local data access manager: users, endpoints and grants, and prints the
//! visible tree or freshly issued links for a user. Paths come from the `DAM_*`
//! environment variables unless `--root` is given.

use std::env;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use dam::config::Settings;
use dam::identity::Role;
use dam::policy::{Action, PolicyFilter};
use dam::AccessManager;

fn print_usage(program: &str) {
    eprintln!(
        "Usage:\n  {program} [--root <data_root>] <command> [args]\n\nCommands:\n  users                                          list users\n  add-user <slug> [--admin]                      register a user\n  remove-user <slug>                             delete a user and all their policies\n  endpoints                                      list endpoints\n  add-endpoint <creator> <name> <flavor> <config.json>\n                                                 connect an endpoint; creator gets (*, admin)\n  remove-endpoint <endpoint>                     delete an endpoint and its policies\n  refresh <endpoint>                             re-list an endpoint\n  grant <slug> <endpoint> <resource> <action>    add a policy\n  revoke <slug> [--endpoint E] [--resource R] [--action A]\n                                                 remove matching policies\n  policies <slug>                                list a user's policies\n  tree <slug> <endpoint> [action...]             print the tree visible to a user (default: read)\n  link <slug> <endpoint> <resource> <action> [--ttl SECS]\n                                                 issue credentials\n\n<endpoint> is an endpoint uuid or name. Actions: read, write, admin, share.\n\nEnvironment:\n  DAM_DATA_ROOT, USER_POLICIES, ENDPOINT_CONFIGS, UUID_STORE, DAM_READ_TTL_SECS, DAM_WRITE_TTL_SECS\n  RUST_LOG (default info)"
    );
}

fn take_flag_value(args: &mut Vec<String>, flag: &str) -> Result<Option<String>> {
    let Some(i) = args.iter().position(|a| a == flag) else { return Ok(None); };
    if i + 1 >= args.len() {
        bail!("{} requires a value", flag);
    }
    let value = args.remove(i + 1);
    args.remove(i);
    Ok(Some(value))
}

fn take_switch(args: &mut Vec<String>, flag: &str) -> bool {
    match args.iter().position(|a| a == flag) {
        Some(i) => { args.remove(i); true }
        None => false,
    }
}

fn arg<'a>(args: &'a [String], i: usize, what: &str) -> Result<&'a str> {
    args.get(i).map(String::as_str).ok_or_else(|| anyhow!("missing <{}>", what))
}

fn resolve_endpoint(manager: &AccessManager, key: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(key) {
        return Ok(manager.endpoints().get(&id)?.uuid);
    }
    Ok(manager.endpoints().get_by_name(key)?.uuid)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(manager: &AccessManager, command: &str, mut args: Vec<String>) -> Result<()> {
    match command {
        "users" => print_json(&manager.identities().list()),
        "add-user" => {
            let role = if take_switch(&mut args, "--admin") { Role::Admin } else { Role::User };
            print_json(&manager.register_user(arg(&args, 0, "slug")?, role)?)
        }
        "remove-user" => {
            let slug = arg(&args, 0, "slug")?;
            let purged = manager.remove_user(slug)?;
            println!("removed '{}' ({} policies)", slug, purged);
            Ok(())
        }
        "endpoints" => {
            let records: Vec<_> = manager.endpoints().list().iter().map(|e| e.record(false)).collect();
            print_json(&records)
        }
        "add-endpoint" => {
            let path = arg(&args, 3, "config.json")?;
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
            let config: serde_json::Value = serde_json::from_str(&text).with_context(|| format!("parsing {}", path))?;
            let ep = manager.add_endpoint(arg(&args, 0, "creator")?, arg(&args, 1, "name")?, arg(&args, 2, "flavor")?, config)?;
            print_json(&ep.record(false))
        }
        "remove-endpoint" => {
            let id = resolve_endpoint(manager, arg(&args, 0, "endpoint")?)?;
            let ep = manager.remove_endpoint(&id)?;
            println!("removed endpoint '{}' ({})", ep.name, ep.uuid);
            Ok(())
        }
        "refresh" => {
            let id = resolve_endpoint(manager, arg(&args, 0, "endpoint")?)?;
            let tree = manager.refresh_endpoint(&id)?;
            println!("{} nodes", tree.len());
            Ok(())
        }
        "grant" => {
            let id = resolve_endpoint(manager, arg(&args, 1, "endpoint")?)?;
            let action: Action = arg(&args, 3, "action")?.parse()?;
            print_json(&manager.grant(arg(&args, 0, "slug")?, &id, arg(&args, 2, "resource")?, action)?)
        }
        "revoke" => {
            let endpoint = match take_flag_value(&mut args, "--endpoint")? {
                Some(key) => Some(resolve_endpoint(manager, &key)?),
                None => None,
            };
            let resource = take_flag_value(&mut args, "--resource")?;
            let action = take_flag_value(&mut args, "--action")?.map(|a| a.parse::<Action>()).transpose()?;
            let subject = manager.subject(arg(&args, 0, "slug")?)?;
            let filter = PolicyFilter { subject: Some(subject.uuid), endpoint, resource, action };
            println!("removed {} policies", manager.revoke(&filter)?);
            Ok(())
        }
        "policies" => {
            let subject = manager.subject(arg(&args, 0, "slug")?)?;
            print_json(&manager.policies().filter(&PolicyFilter::subject(subject.uuid)))
        }
        "tree" => {
            let id = resolve_endpoint(manager, arg(&args, 1, "endpoint")?)?;
            let mut actions = args[2..].iter().map(|a| a.parse::<Action>()).collect::<Result<Vec<_>, _>>()?;
            if actions.is_empty() { actions.push(Action::Read); }
            let parts = manager.visible_tree(arg(&args, 0, "slug")?, &id, &actions)?;
            let views: std::collections::BTreeMap<String, _> =
                parts.iter().map(|(a, t)| (a.to_string(), t.nested())).collect();
            print_json(&views)
        }
        "link" => {
            let ttl = take_flag_value(&mut args, "--ttl")?
                .map(|s| s.parse::<u64>().map(Duration::from_secs))
                .transpose()
                .context("--ttl expects seconds")?;
            let slug = arg(&args, 0, "slug")?;
            let id = resolve_endpoint(manager, arg(&args, 1, "endpoint")?)?;
            let resource = arg(&args, 2, "resource")?;
            let action: Action = arg(&args, 3, "action")?.parse()?;
            let cred = match ttl {
                Some(ttl) => manager.issue_access(slug, &id, resource, action, ttl)?,
                None => manager.issue_access_default(slug, &id, resource, action)?,
            };
            print_json(&cred)
        }
        other => bail!("unknown command '{}'", other),
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let mut args: Vec<String> = env::args().collect();
    let program = args.remove(0);
    if args.is_empty() || args.iter().any(|a| a == "-h" || a == "--help") {
        print_usage(&program);
        return Ok(());
    }
    let settings = match take_flag_value(&mut args, "--root")? {
        Some(root) => Settings::rooted_at(root),
        None => Settings::from_env(),
    };
    info!(target: "dam", "data root '{}'", settings.data_root.display());

    let command = args.remove(0);
    let manager = AccessManager::open(settings)?;
    let result = run(&manager, &command, args);
    manager.shutdown();
    if let Err(e) = &result {
        if e.to_string().starts_with("missing <") {
            print_usage(&program);
        }
    }
    result
}
