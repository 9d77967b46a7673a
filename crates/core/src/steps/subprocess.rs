use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};

use indexmap::IndexMap;
use regex::Regex;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::descriptor::{OpMetaInfo, MONITOR_INPUT_NAME};
use crate::error::{Result, WorkflowError};
use crate::monitor::Monitor;
use crate::types::Value;

/// Step that computes its output by launching a sub-process.
///
/// The command is a template whose `{name}` fields are interpolated with
/// input values, or with temp-file paths for inputs marshalled through the
/// `write_to` / `read_from` port properties. Progress is scraped from the
/// process' stdout with the three marker regexes.
#[derive(Debug, Clone, Default)]
pub struct SubProcessStep {
    command: String,
    run_python: bool,
    cwd: Option<String>,
    env: IndexMap<String, String>,
    shell: bool,
    started_re: Option<String>,
    progress_re: Option<String>,
    done_re: Option<String>,
}

impl SubProcessStep {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Default::default()
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn run_python(mut self, run_python: bool) -> Self {
        self.run_python = run_python;
        self
    }

    pub fn cwd(mut self, cwd: &str) -> Self {
        self.cwd = Some(cwd.to_string());
        self
    }

    pub fn env(mut self, name: &str, value: &str) -> Self {
        self.env.insert(name.to_string(), value.to_string());
        self
    }

    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    pub fn started_re(mut self, pattern: &str) -> Self {
        self.started_re = Some(pattern.to_string());
        self
    }

    pub fn progress_re(mut self, pattern: &str) -> Self {
        self.progress_re = Some(pattern.to_string());
        self
    }

    pub fn done_re(mut self, pattern: &str) -> Self {
        self.done_re = Some(pattern.to_string());
        self
    }

    pub(crate) fn is_run_python(&self) -> bool {
        self.run_python
    }

    pub(crate) fn cwd_value(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    pub(crate) fn env_values(&self) -> &IndexMap<String, String> {
        &self.env
    }

    pub(crate) fn is_shell(&self) -> bool {
        self.shell
    }

    pub(crate) fn started_re_value(&self) -> Option<&str> {
        self.started_re.as_deref()
    }

    pub(crate) fn progress_re_value(&self) -> Option<&str> {
        self.progress_re.as_deref()
    }

    pub(crate) fn done_re_value(&self) -> Option<&str> {
        self.done_re.as_deref()
    }

    pub(crate) fn invoke(
        &self,
        meta: &OpMetaInfo,
        mut input_values: IndexMap<String, Value>,
        monitor: &dyn Monitor,
    ) -> Result<Value> {
        meta.set_default_input_values(&mut input_values);
        meta.validate_input_values(&input_values)?;

        // Temp files outlive the invocation of the child process.
        let mut temp_files: Vec<NamedTempFile> = Vec::new();
        let mut substitutions: HashMap<String, String> = HashMap::new();
        let mut read_from_index: Option<usize> = None;

        for (name, value) in &input_values {
            if name != MONITOR_INPUT_NAME {
                substitutions.insert(name.clone(), value.to_text());
            }
        }
        for (name, props) in meta.inputs() {
            if let Some(target) = &props.write_to {
                let mut file = NamedTempFile::new()?;
                let json = input_values
                    .get(name)
                    .cloned()
                    .unwrap_or(Value::Null)
                    .to_json()?;
                file.write_all(json.to_string().as_bytes())?;
                file.flush()?;
                substitutions.insert(target.clone(), file.path().display().to_string());
                temp_files.push(file);
            }
            if let Some(target) = &props.read_from {
                let file = NamedTempFile::new()?;
                substitutions.insert(target.clone(), file.path().display().to_string());
                read_from_index = Some(temp_files.len());
                temp_files.push(file);
            }
        }

        let rendered = render_command(&self.command, &substitutions)?;
        debug!(command = %rendered, "launching sub-process");

        let started_re = compile_marker(self.started_re.as_deref())?;
        let progress_re = compile_marker(self.progress_re.as_deref())?;
        let done_re = compile_marker(self.done_re.as_deref())?;

        let mut command = self.build_command(&rendered)?;
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WorkflowError::SubprocessFailed {
                command: rendered.clone(),
                reason: format!("launch failed: {e}"),
            })?;

        // Drain stderr on a helper thread so neither pipe can fill up and
        // stall the child.
        let stderr = child.stderr.take();
        let stderr_thread = stderr.map(|mut stream| {
            std::thread::spawn(move || {
                let mut buffer = String::new();
                let _ = stream.read_to_string(&mut buffer);
                buffer
            })
        });

        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = line?;
                debug!(target: "subprocess_stdout", "{line}");

                if monitor.is_cancelled() {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(WorkflowError::Canceled);
                }

                if let Some(captures) = started_re.as_ref().and_then(|re| re.captures(&line)) {
                    let label = captures
                        .name("label")
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_else(|| rendered.clone());
                    let total_work = captures
                        .name("total_work")
                        .and_then(|m| m.as_str().parse::<f64>().ok())
                        .unwrap_or(0.0);
                    monitor.started(&label, total_work);
                    continue;
                }
                if let Some(captures) = progress_re.as_ref().and_then(|re| re.captures(&line)) {
                    if let Some(work) = captures
                        .name("work")
                        .and_then(|m| m.as_str().parse::<f64>().ok())
                    {
                        monitor.progress(work);
                    }
                    if let Some(msg) = captures.name("msg") {
                        monitor.message(msg.as_str());
                    }
                    continue;
                }
                if done_re.as_ref().is_some_and(|re| re.is_match(&line)) {
                    monitor.done();
                }
            }
        }

        let status = child.wait()?;
        if let Some(thread) = stderr_thread {
            if let Ok(buffer) = thread.join() {
                for line in buffer.lines() {
                    warn!(target: "subprocess_stderr", "{line}");
                }
            }
        }

        if !status.success() {
            return Err(WorkflowError::SubprocessFailed {
                command: rendered,
                reason: match status.code() {
                    Some(code) => format!("exit code {code}"),
                    None => "terminated by signal".to_string(),
                },
            });
        }

        if let Some(index) = read_from_index {
            let contents = std::fs::read_to_string(temp_files[index].path())?;
            if contents.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(match serde_json::from_str::<serde_json::Value>(&contents) {
                Ok(json) => Value::from_json(&json),
                Err(_) => Value::Str(contents.trim_end().to_string()),
            });
        }
        Ok(Value::Int(i64::from(status.code().unwrap_or(0))))
    }

    fn build_command(&self, rendered: &str) -> Result<Command> {
        let line = if self.run_python {
            format!("python3 {rendered}")
        } else {
            rendered.to_string()
        };

        let mut command = if self.shell {
            if cfg!(windows) {
                let mut command = Command::new("cmd");
                command.arg("/C").arg(&line);
                command
            } else {
                let mut command = Command::new("sh");
                command.arg("-c").arg(&line);
                command
            }
        } else {
            let mut parts = line.split_whitespace();
            let program = parts.next().ok_or_else(|| {
                WorkflowError::InvalidEncoding("sub-process command is empty".to_string())
            })?;
            let mut command = Command::new(program);
            command.args(parts);
            command
        };

        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        for (name, value) in &self.env {
            command.env(name, value);
        }
        Ok(command)
    }
}

fn compile_marker(pattern: Option<&str>) -> Result<Option<Regex>> {
    match pattern {
        None => Ok(None),
        Some(pattern) => Regex::new(pattern).map(Some).map_err(|e| {
            WorkflowError::InvalidEncoding(format!("invalid marker regex '{pattern}': {e}"))
        }),
    }
}

/// Interpolate `{name}` fields with their substitution texts. Unknown names
/// are encoding errors.
fn render_command(template: &str, substitutions: &HashMap<String, String>) -> Result<String> {
    let placeholder = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex");

    let mut rendered = String::with_capacity(template.len());
    let mut cursor = 0;
    for captures in placeholder.captures_iter(template) {
        let full = captures.get(0).expect("full match");
        let name = &captures[1];
        let replacement = substitutions.get(name).ok_or_else(|| {
            WorkflowError::InvalidEncoding(format!(
                "command refers to unknown input '{{{name}}}'"
            ))
        })?;
        rendered.push_str(&template[cursor..full.start()]);
        rendered.push_str(replacement);
        cursor = full.end();
    }
    rendered.push_str(&template[cursor..]);
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PortProps;
    use crate::monitor::NullMonitor;

    fn substitutions(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_command() {
        let rendered = render_command(
            "resample --rate {rate} {src}",
            &substitutions(&[("rate", "0.5"), ("src", "/tmp/in.nc")]),
        )
        .expect("render should succeed");
        assert_eq!(rendered, "resample --rate 0.5 /tmp/in.nc");

        let err = render_command("tool {missing}", &substitutions(&[]))
            .expect_err("unknown placeholder should fail");
        assert!(matches!(err, WorkflowError::InvalidEncoding(_)));
    }

    #[test]
    fn test_invalid_marker_regex_is_rejected() {
        let meta = OpMetaInfo::new("bad_re").with_return_output();
        let step = SubProcessStep::new("true").started_re("(unclosed");

        let err = step
            .invoke(&meta, IndexMap::new(), &NullMonitor)
            .expect_err("invalid regex should fail");
        assert!(matches!(err, WorkflowError::InvalidEncoding(_)));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::cell::{Cell, RefCell};

        #[derive(Default)]
        struct Recorder {
            started: RefCell<Vec<(String, f64)>>,
            worked: Cell<f64>,
            messages: RefCell<Vec<String>>,
            done_calls: Cell<usize>,
        }

        impl Monitor for Recorder {
            fn started(&self, label: &str, total_work: f64) {
                self.started
                    .borrow_mut()
                    .push((label.to_string(), total_work));
            }

            fn progress(&self, work: f64) {
                self.worked.set(self.worked.get() + work);
            }

            fn message(&self, msg: &str) {
                self.messages.borrow_mut().push(msg.to_string());
            }

            fn done(&self) {
                self.done_calls.set(self.done_calls.get() + 1);
            }
        }

        #[test]
        fn test_exit_code_zero_is_returned() {
            let meta = OpMetaInfo::new("sp_true").with_return_output();
            let step = SubProcessStep::new("true");

            let result = step
                .invoke(&meta, IndexMap::new(), &NullMonitor)
                .expect("true should succeed");
            assert_eq!(result, Value::Int(0));
        }

        #[test]
        fn test_nonzero_exit_fails() {
            let meta = OpMetaInfo::new("sp_fail").with_return_output();
            let step = SubProcessStep::new("exit 3").shell(true);

            let err = step
                .invoke(&meta, IndexMap::new(), &NullMonitor)
                .expect_err("exit 3 should fail");
            match err {
                WorkflowError::SubprocessFailed { reason, .. } => {
                    assert_eq!(reason, "exit code 3");
                }
                other => panic!("expected SubprocessFailed, got {other}"),
            }
        }

        #[test]
        fn test_input_interpolation_with_shell() {
            let meta = OpMetaInfo::new("sp_echo")
                .with_input("greeting", PortProps::default())
                .with_return_output();
            let step = SubProcessStep::new("test \"{greeting}\" = hello").shell(true);

            let mut inputs = IndexMap::new();
            inputs.insert("greeting".to_string(), Value::Str("hello".to_string()));
            step.invoke(&meta, inputs, &NullMonitor)
                .expect("interpolated test should pass");
        }

        #[test]
        fn test_progress_markers_drive_monitor() {
            let meta = OpMetaInfo::new("sp_progress").with_return_output();
            let step = SubProcessStep::new(
                "printf 'START resample 10\\nWORKED 4 reading\\nWORKED 6 writing\\nFINISHED\\n'",
            )
            .shell(true)
            .started_re(r"START (?P<label>\w+) (?P<total_work>\d+)")
            .progress_re(r"WORKED (?P<work>\d+) (?P<msg>\w+)")
            .done_re(r"FINISHED");

            let recorder = Recorder::default();
            step.invoke(&meta, IndexMap::new(), &recorder)
                .expect("marker run should succeed");

            assert_eq!(
                recorder.started.borrow().as_slice(),
                [("resample".to_string(), 10.0)]
            );
            assert!((recorder.worked.get() - 10.0).abs() < 1e-9);
            assert_eq!(
                recorder.messages.borrow().as_slice(),
                ["reading".to_string(), "writing".to_string()]
            );
            assert_eq!(recorder.done_calls.get(), 1);
        }

        #[test]
        fn test_write_to_and_read_from_marshalling() {
            let meta = OpMetaInfo::new("sp_copy")
                .with_input(
                    "payload",
                    PortProps {
                        write_to: Some("src_file".to_string()),
                        read_from: Some("dst_file".to_string()),
                        ..Default::default()
                    },
                )
                .with_return_output();
            let step = SubProcessStep::new("cp {src_file} {dst_file}");

            let mut inputs = IndexMap::new();
            inputs.insert(
                "payload".to_string(),
                Value::List(vec![Value::Int(1), Value::Int(2)]),
            );
            let result = step
                .invoke(&meta, inputs, &NullMonitor)
                .expect("copy through temp files should succeed");
            assert_eq!(result, Value::List(vec![Value::Int(1), Value::Int(2)]));
        }

        #[test]
        fn test_env_and_cwd_are_applied() {
            let dir = tempfile::tempdir().expect("tempdir");
            std::fs::write(dir.path().join("probe.txt"), "x").expect("probe file");

            let meta = OpMetaInfo::new("sp_env").with_return_output();
            let step = SubProcessStep::new("test \"$MARKER\" = on -a -f probe.txt")
                .shell(true)
                .env("MARKER", "on")
                .cwd(&dir.path().display().to_string());

            step.invoke(&meta, IndexMap::new(), &NullMonitor)
                .expect("env and cwd should be visible to the shell");
        }
    }
}
