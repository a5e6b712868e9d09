/*
FaF Scope is a live packet capture and network probe toolkit
Copyright (C) 2022  James Bates

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! Running the external probe commands

/// Exit code shells use for a command which does not exist
const EXIT_COMMAND_NOT_FOUND: i32 = 127;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
   pub program: String,
   pub args: Vec<String>,
}

impl CommandSpec {
   pub fn new(program: &str, args: &[&str]) -> Self {
      Self { program: program.to_string(), args: args.iter().map(|arg| arg.to_string()).collect() }
   }

   /// Arguments followed by `target`
   pub fn args_for(&self, target: &str) -> Vec<String> {
      let mut args = self.args.clone();
      args.push(target.to_string());
      args
   }

   /// One spec per entry of the platform candidate list, primary first
   pub fn platform_defaults() -> Vec<CommandSpec> {
      crate::statics::PROBE_COMMANDS.iter().map(|(program, args)| CommandSpec::new(program, args)).collect()
   }
}

impl std::fmt::Display for CommandSpec {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      write!(f, "{}", self.program)?;
      for arg in &self.args {
         write!(f, " {arg}")?;
      }
      Ok(())
   }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
   /// None when the process was killed by a signal
   pub code: Option<i32>,
   pub stdout: String,
   pub stderr: String,
}

impl CommandOutput {
   pub fn success(&self) -> bool {
      self.code == Some(0) && self.stderr.trim().is_empty()
   }

   /// The command ran through a shell or wrapper which reported it missing
   pub fn reports_missing(&self) -> bool {
      if self.code == Some(EXIT_COMMAND_NOT_FOUND) {
         return true;
      }
      let stderr = self.stderr.to_ascii_lowercase();
      self.code != Some(0) && (stderr.contains("command not found") || stderr.contains("no such file or directory"))
   }
}

/// Spawns a process and collects its output
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
   /// `Err` with `ErrorKind::NotFound` when the program does not exist, `ErrorKind::TimedOut` when
   /// `timeout` elapsed first
   async fn run(&self, program: &str, args: &[String], timeout: Option<std::time::Duration>) -> std::io::Result<CommandOutput>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemCommandRunner;

#[async_trait::async_trait]
impl CommandRunner for SystemCommandRunner {
   async fn run(&self, program: &str, args: &[String], timeout: Option<std::time::Duration>) -> std::io::Result<CommandOutput> {
      let mut command = tokio::process::Command::new(program);
      command.args(args).stdin(std::process::Stdio::null()).kill_on_drop(true);

      let output = match timeout {
         Some(limit) => match tokio::time::timeout(limit, command.output()).await {
            Ok(output) => output?,
            Err(_) => return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, format!("{program} timed out"))),
         },
         None => command.output().await?,
      };

      Ok(CommandOutput {
         code: output.status.code(),
         stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
         stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
      })
   }
}

/// Drops lines starting with one of `banner_prefixes`, collapses runs of blank lines and trims
/// leading and trailing blank lines
pub fn clean_output<S: AsRef<str>>(stdout: &str, banner_prefixes: &[S]) -> String {
   let mut lines: Vec<&str> = Vec::new();
   let mut previous_blank = true;

   for line in stdout.lines() {
      let line = line.trim_end();
      let trimmed = line.trim_start();
      if banner_prefixes.iter().any(|prefix| trimmed.starts_with(prefix.as_ref())) {
         continue;
      }

      let blank = trimmed.is_empty();
      if blank && previous_blank {
         continue;
      }
      lines.push(line);
      previous_blank = blank;
   }

   while lines.last().map(|line| line.is_empty()).unwrap_or(false) {
      lines.pop();
   }

   lines.join("\n")
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_clean_output() {
      let raw = "% whois banner\n\n\nhop 1  10.0.0.1\n# comment\n\n\n\nhop 2  1.1.1.1\n   \n\n";
      assert_eq!(clean_output(raw, &crate::statics::PROBE_BANNER_PREFIXES), "hop 1  10.0.0.1\n\nhop 2  1.1.1.1");
   }

   #[test]
   fn test_clean_output_no_prefixes() {
      assert_eq!(clean_output::<&str>("a\n\n\nb", &[]), "a\n\nb");
      assert_eq!(clean_output::<&str>("", &[]), "");
   }

   #[test]
   fn test_output_classification() {
      let ok = CommandOutput { code: Some(0), stdout: "x".into(), stderr: String::new() };
      assert!(ok.success());
      assert!(!ok.reports_missing());

      let noisy = CommandOutput { code: Some(0), stdout: "x".into(), stderr: "warning".into() };
      assert!(!noisy.success());

      let shell_missing = CommandOutput { code: Some(127), stdout: String::new(), stderr: "sh: whois: not found".into() };
      assert!(shell_missing.reports_missing());

      let failed = CommandOutput { code: Some(1), stdout: String::new(), stderr: "unknown host".into() };
      assert!(!failed.reports_missing());
      assert!(!failed.success());
   }

   #[test]
   fn test_args_for_appends_target() {
      let spec = CommandSpec::new("whois", &["-n"]);
      assert_eq!(spec.args_for("example.org"), vec!["-n".to_string(), "example.org".to_string()]);
      assert_eq!(spec.to_string(), "whois -n");
   }

   #[test]
   fn test_platform_defaults() {
      let defaults = CommandSpec::platform_defaults();
      assert!(!defaults.is_empty());
      #[cfg(unix)]
      assert_eq!(defaults.len(), 2);
      assert_eq!(defaults[0].program, "whois");
   }

   #[cfg(unix)]
   #[test]
   fn test_system_runner_reports_not_found() {
      let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
      let result = runtime.block_on(SystemCommandRunner.run("faf-scope-no-such-binary", &[], None));
      assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::NotFound);
   }

   #[cfg(unix)]
   #[test]
   fn test_system_runner_captures_output() {
      let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
      let output = runtime.block_on(SystemCommandRunner.run("sh", &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()], None)).unwrap();
      assert_eq!(output.code, Some(3));
      assert_eq!(output.stdout.trim(), "out");
      assert_eq!(output.stderr.trim(), "err");
   }

   #[cfg(unix)]
   #[test]
   fn test_system_runner_stderr_with_zero_exit_is_not_success() {
      let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
      let script = "echo 'traceroute to 1.1.1.1, 30 hops max' >&2; echo ' 1  10.0.0.1'; exit 0".to_string();
      let output = runtime.block_on(SystemCommandRunner.run("sh", &["-c".to_string(), script], None)).unwrap();

      assert_eq!(output.code, Some(0));
      assert_eq!(output.stdout.trim(), "1  10.0.0.1");
      assert!(!output.success());
      assert!(!output.reports_missing());
   }

   #[cfg(unix)]
   #[test]
   fn test_system_runner_timeout() {
      let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
      let result = runtime.block_on(SystemCommandRunner.run(
         "sh",
         &["-c".to_string(), "sleep 5".to_string()],
         Some(std::time::Duration::from_millis(100)),
      ));
      assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::TimedOut);
   }
}
