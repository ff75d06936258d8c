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

//! Utilities for process-handling

use std::env;
use std::ffi::OsStr;

use itertools::Itertools;
use shell_words::quote as escape;

/// Returns a human-readable version of how the current process was invoked.
///
/// Only env vars that start with `env_prefix` are included.
pub fn invocation(env_prefix: &str) -> String {
    env::vars_os()
        .map(|(name, value)| {
            (
                name.to_string_lossy().into_owned(),
                value.to_string_lossy().into_owned(),
            )
        })
        .filter(|(name, _value)| name.starts_with(env_prefix))
        .sorted()
        .map(|(name, value)| format!("{}={}", escape(&name), escape(&value)))
        .chain(env::args().map(|arg| escape(&arg).into_owned()))
        .join(" ")
}

/// Renders a program and its arguments as a single shell-quoted command line.
///
/// The result is only meant for humans reading logs. Processes are always
/// spawned with discrete arguments, never through a shell.
pub fn render_command<P, I, A>(program: P, args: I) -> String
where
    P: AsRef<OsStr>,
    I: IntoIterator<Item = A>,
    A: AsRef<OsStr>,
{
    std::iter::once(program.as_ref().to_string_lossy().into_owned())
        .chain(
            args.into_iter()
                .map(|arg| arg.as_ref().to_string_lossy().into_owned()),
        )
        .map(|part| escape(&part).into_owned())
        .join(" ")
}
