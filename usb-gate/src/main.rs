//! usb-gate - trusted USB device admission.
//!
//! A privileged udev helper invokes `usb-gate udev add|remove <devpath>` as
//! devices come and go; the policy daemon consumes `usb-gate genrules`
//! output; a periodic job runs `usb-gate cleanup`; the session manager runs
//! `usb-gate userlogin` when the primary user signs in.

mod entry_manager;
mod error;
mod fingerprint;
mod rule;
mod store;

use std::path::{Path, PathBuf};
use std::process;

use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::entry_manager::{find_user_db_dir, EntryManager, UdevAction};
use crate::error::Result;

fn print_usage() {
    eprintln!(
        r#"Usage:
  help - prints this help message.
  cleanup - removes stale allow-list entries.
  genrules - writes the generated rules configuration to stdout.
  udev (add|remove) <devpath> - handles a udev device event.
  userlogin - add current entries to the user allow-list."#
    );
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        error!("Invalid options!");
        print_usage();
        process::exit(1);
    }

    let command = args[1].as_str();
    let command_args = &args[2..];

    let status = match command {
        "cleanup" => handle_cleanup(command_args),
        "genrules" => handle_genrules(command_args),
        "udev" => handle_udev(command_args),
        "userlogin" => handle_userlogin(command_args),
        other => {
            if other != "help" {
                error!("Invalid options!");
            }
            print_usage();
            process::exit(1);
        }
    };

    match status {
        Ok(()) => {}
        Err(e) => {
            error!("{} failed: {}", command, e);
            process::exit(1);
        }
    }
}

fn open_manager() -> Result<EntryManager> {
    let root = PathBuf::from("/");
    let user_db_dir = find_user_db_dir(&root);
    let sysfs_root = root.clone();
    EntryManager::new(
        root,
        user_db_dir,
        Box::new(move |devpath| rule_from_sysfs(&sysfs_root, devpath)),
    )
}

fn handle_cleanup(args: &[String]) -> Result<()> {
    require_no_args(args);
    open_manager()?.garbage_collect()
}

fn handle_genrules(args: &[String]) -> Result<()> {
    require_no_args(args);
    let rules = open_manager()?.generate_rules()?;
    print!("{}", rules);
    Ok(())
}

fn handle_udev(args: &[String]) -> Result<()> {
    if args.len() != 2 {
        error!("Invalid options!");
        print_usage();
        process::exit(1);
    }

    let action = match args[0].as_str() {
        "add" => UdevAction::Add,
        "remove" => UdevAction::Remove,
        _ => {
            error!("Invalid options!");
            print_usage();
            process::exit(1);
        }
    };

    open_manager()?.handle_event(action, &args[1])
}

fn handle_userlogin(args: &[String]) -> Result<()> {
    require_no_args(args);
    open_manager()?.handle_user_login()
}

fn require_no_args(args: &[String]) {
    if !args.is_empty() {
        error!("Invalid options!");
        print_usage();
        process::exit(1);
    }
}

/// Builds an allow rule from the device's sysfs attributes. Returns an empty
/// string (rejected downstream) when the id attributes are missing.
fn rule_from_sysfs(root: &Path, devpath: &str) -> String {
    let device = root.join("sys").join(devpath.trim_start_matches('/'));
    let attr = |name: &str| {
        std::fs::read_to_string(device.join(name))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let (Some(vendor), Some(product)) = (attr("idVendor"), attr("idProduct")) else {
        return String::new();
    };

    let mut rule = format!("allow id {}:{}", vendor, product);
    if let Some(serial) = attr("serial") {
        rule.push_str(&format!(" serial \"{}\"", quote(&serial)));
    }
    if let Some(name) = attr("product") {
        rule.push_str(&format!(" name \"{}\"", quote(&name)));
    }
    rule
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
