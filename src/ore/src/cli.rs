// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Command-line parsing utilities.

use clap::Parser;

/// A help template for use with clap that does not include the name of the
/// binary or the version in the help output.
const NO_VERSION_HELP_TEMPLATE: &str = "{about}

USAGE:
    {usage}

{all-args}";

/// Configures command-line parsing via [`parse_args`].
#[derive(Debug, Default, Clone)]
pub struct CliConfig<'a> {
    /// An optional prefix to apply to the environment variable name for all
    /// arguments with an environment variable fallback.
    pub env_prefix: Option<&'a str>,
    /// Enable clap's built-in `--version` flag.
    ///
    /// We disable this by default because most of our binaries are not
    /// meaningfully versioned.
    pub enable_version_flag: bool,
}

/// Parses command-line arguments according to a clap `Parser` after
/// applying gateway-specific customizations.
pub fn parse_args<O>(config: CliConfig) -> O
where
    O: Parser,
{
    parse_args_from(config, std::env::args_os())
}

/// Like [`parse_args`], but parses the provided iterator of arguments rather
/// than the arguments of the current process.
pub fn parse_args_from<O, I, T>(config: CliConfig, args: I) -> O
where
    O: Parser,
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let mut clap = O::command().args_override_self(true);

    if !config.enable_version_flag {
        clap = clap.disable_version_flag(true);
        clap = clap.help_template(NO_VERSION_HELP_TEMPLATE);
    }

    if let Some(prefix) = config.env_prefix {
        clap = clap.mut_args(|arg| match arg.get_env() {
            Some(env) => {
                let env = format!("{prefix}{}", env.to_string_lossy());
                arg.env(env)
            }
            None => arg,
        });
    }

    let matches = clap.get_matches_from(args);
    O::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
}
