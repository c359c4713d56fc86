// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging section of the host configuration file

use serde::{Deserialize, Serialize};

use crate::{CliLogLevel, CliLoggingArgs, LogFormat};

/// `"logging"` object of the JSON configuration. Command-line flags win over it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoggingConfig {
    pub log_level: Option<CliLogLevel>,
    pub log_format: Option<LogFormat>,
    pub log_file: Option<String>,
}

impl LoggingConfig {
    /// Fill in whatever the command line left unset.
    pub fn apply_to(&self, args: &mut CliLoggingArgs) {
        if args.log_level.is_none() {
            args.log_level = self.log_level;
        }
        if args.log_format.is_none() {
            args.log_format = self.log_format;
        }
        if args.log_file.is_none() {
            args.log_file = self.log_file.clone();
        }
    }
}
