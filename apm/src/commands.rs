//! Agent commands queued by the collector.
//!
//! Commands arrive as `(id, name, arguments)` and are looked up by name in
//! [`COMMAND_HANDLERS`]. Names the agent does not know are skipped.

use apm_common::{AgentCommandRequest, CommandReply, CommandResults};
use log::{debug, warn};
use serde::Deserialize;
use std::time::Duration;

use crate::application::Application;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartProfilerArgs {
    pub profile_id: i64,
    /// Seconds between samples
    pub sample_period: f64,
    /// Seconds to keep sampling
    pub duration: f64,
    #[serde(default)]
    pub profile_agent_code: bool,
}

impl StartProfilerArgs {
    /// The sample period, if it is positive and finite.
    #[must_use]
    pub fn sample_period(&self) -> Option<Duration> {
        positive_secs(self.sample_period)
    }

    /// The session length, if it is positive and finite.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        positive_secs(self.duration)
    }
}

fn positive_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok().filter(|d| !d.is_zero())
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StopProfilerArgs {
    pub report_data: bool,
}

/// Every command the agent understands.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCommand {
    StartProfiler(StartProfilerArgs),
    StopProfiler(StopProfilerArgs),
}

impl AgentCommand {
    /// Run the command against `app`.
    pub fn execute(&self, app: &Application) -> CommandReply {
        match self {
            AgentCommand::StartProfiler(args) => app.start_profiler(args),
            AgentCommand::StopProfiler(args) => app.stop_profiler(args),
        }
    }
}

type Parser = fn(&serde_json::Value) -> Result<AgentCommand, serde_json::Error>;

fn parse_start_profiler(arguments: &serde_json::Value) -> Result<AgentCommand, serde_json::Error> {
    StartProfilerArgs::deserialize(arguments).map(AgentCommand::StartProfiler)
}

fn parse_stop_profiler(arguments: &serde_json::Value) -> Result<AgentCommand, serde_json::Error> {
    StopProfilerArgs::deserialize(arguments).map(AgentCommand::StopProfiler)
}

/// Command name to argument parser.
pub const COMMAND_HANDLERS: &[(&str, Parser)] = &[
    ("start_profiler", parse_start_profiler),
    ("stop_profiler", parse_stop_profiler),
];

/// Parse a queued command.
///
/// Returns `None` for names without a handler.
#[must_use]
pub fn parse(request: &AgentCommandRequest) -> Option<Result<AgentCommand, serde_json::Error>> {
    COMMAND_HANDLERS
        .iter()
        .find(|(name, _)| *name == request.name)
        .map(|(_, parser)| parser(&request.arguments))
}

/// Execute one queued command, returning the reply to send back.
///
/// Unknown commands produce no reply.
pub fn dispatch(app: &Application, request: &AgentCommandRequest) -> Option<CommandResults> {
    let Some(parsed) = parse(request) else {
        debug!("Skipping unknown agent command {:?}", request.name);
        return None;
    };

    let reply = match parsed {
        Ok(command) => command.execute(app),
        Err(err) => {
            warn!("Invalid arguments for agent command {:?}: {err}", request.name);
            CommandReply::error(format!("Invalid arguments: {err}"))
        }
    };
    debug!("Agent command {} ({}) -> {:?}", request.id, request.name, reply);
    Some(CommandResults::from([(request.id, reply)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(name: &str, arguments: serde_json::Value) -> AgentCommandRequest {
        AgentCommandRequest { id: 1, name: name.to_string(), arguments }
    }

    #[test]
    fn test_parse_start_profiler() {
        let command = parse(&request(
            "start_profiler",
            json!({"profile_id": 42, "sample_period": 0.1, "duration": 120.0}),
        ))
        .unwrap()
        .unwrap();

        let AgentCommand::StartProfiler(args) = command else {
            panic!("expected start_profiler");
        };
        assert_eq!(args.profile_id, 42);
        assert!(!args.profile_agent_code);
        assert_eq!(args.sample_period(), Some(Duration::from_millis(100)));
        assert_eq!(args.duration(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_parse_stop_profiler_requires_report_flag() {
        assert_eq!(
            parse(&request("stop_profiler", json!({"report_data": false}))).unwrap().unwrap(),
            AgentCommand::StopProfiler(StopProfilerArgs { report_data: false })
        );
        assert!(parse(&request("stop_profiler", json!({}))).unwrap().is_err());
    }

    #[test]
    fn test_unknown_command_has_no_handler() {
        assert!(parse(&request("restart", json!({}))).is_none());
    }

    #[test]
    fn test_non_positive_periods_rejected() {
        let args = StartProfilerArgs {
            profile_id: 1,
            sample_period: 0.0,
            duration: -5.0,
            profile_agent_code: false,
        };
        assert_eq!(args.sample_period(), None);
        assert_eq!(args.duration(), None);
    }
}
