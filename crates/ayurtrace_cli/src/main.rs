//! Operator smoke entry point.
//!
//! # Responsibility
//! - Verify that `ayurtrace_core` can reach the configured store.
//! - Optionally resolve one QR code for a quick end-to-end check.
//!
//! Usage: `ayurtrace_cli [resolve-qr <code>]`

use ayurtrace_core::{
    core_version, init_logging_from_env, Gateway, GatewayProvenanceRepository, ProvenanceError,
    ProvenanceService,
};
use log::{error, info};
use std::process::ExitCode;

fn main() -> ExitCode {
    if let Err(err) = init_logging_from_env() {
        eprintln!("logging disabled: {err}");
    }
    println!("ayurtrace_core version={}", core_version());

    let gateway = match Gateway::connect_from_env() {
        Ok(gateway) => gateway,
        Err(err) => {
            error!("event=cli_connect module=cli status=error error={err}");
            eprintln!("store unavailable: {err}");
            return ExitCode::FAILURE;
        }
    };
    let health = gateway.health();
    println!("store target={} health={}", gateway.target(), health);

    let code = match parse_args(std::env::args().skip(1)) {
        Ok(command) => match command {
            Some(code) => resolve(&gateway, &code),
            None if health.is_healthy() => ExitCode::SUCCESS,
            None => ExitCode::FAILURE,
        },
        Err(usage) => {
            eprintln!("{usage}");
            ExitCode::from(2)
        }
    };

    gateway.close();
    info!("event=cli_exit module=cli status=ok");
    code
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<String>, String> {
    const USAGE: &str = "usage: ayurtrace_cli [resolve-qr <code>]";
    match (args.next(), args.next(), args.next()) {
        (None, _, _) => Ok(None),
        (Some(command), Some(code), None) if command == "resolve-qr" => Ok(Some(code)),
        _ => Err(USAGE.to_string()),
    }
}

fn resolve(gateway: &Gateway, code: &str) -> ExitCode {
    let service = ProvenanceService::new(GatewayProvenanceRepository::new(gateway));
    match service.resolve_qr_code(code) {
        Ok(payload) => {
            println!(
                "product_name={}",
                payload.product_name.as_deref().unwrap_or("-")
            );
            println!(
                "traceability_data={}",
                payload.traceability_data.as_deref().unwrap_or("-")
            );
            ExitCode::SUCCESS
        }
        Err(err @ ProvenanceError::NotFound { .. }) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!("event=cli_resolve_qr module=cli status=error error={err}");
            eprintln!("lookup failed: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_args;

    fn args(values: &[&str]) -> impl Iterator<Item = String> {
        values
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn parse_args_accepts_probe_and_resolve() {
        assert_eq!(parse_args(args(&[])).unwrap(), None);
        assert_eq!(
            parse_args(args(&["resolve-qr", "ABC123"])).unwrap(),
            Some("ABC123".to_string())
        );
    }

    #[test]
    fn parse_args_rejects_unknown_shapes() {
        assert!(parse_args(args(&["resolve-qr"])).is_err());
        assert!(parse_args(args(&["lookup", "ABC123"])).is_err());
        assert!(parse_args(args(&["resolve-qr", "A", "B"])).is_err());
    }
}
