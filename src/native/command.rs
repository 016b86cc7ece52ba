use std::sync::LazyLock;

use itertools::Itertools;

use crate::{
    constants::{EXECUTION_UUID_ENV_VAR, MAX_RUNLENGTH_SENTINEL},
    core::domain::RunConfig,
};

/// Name of the variable carrying the execution id. Nested invocations see
/// the variable of their parent and pick the first free `_SUB_<n>` name.
pub static EXECUTION_ID_ENV_VAR: LazyLock<String> = LazyLock::new(|| {
    execution_id_variable(EXECUTION_UUID_ENV_VAR, |name| {
        std::env::var_os(name).is_some()
    })
});

pub fn execution_id_variable(base: &str, is_defined: impl Fn(&str) -> bool) -> String {
    if !is_defined(base) {
        return base.to_string();
    }
    (0..)
        .map(|i| format!("{}_SUB_{}", base, i))
        .find(|name| !is_defined(name))
        .unwrap_or_else(|| base.to_string())
}

/// Splits a command line into words. Single quotes are literal, double
/// quotes allow backslash escapes, unquoted backslashes escape one char.
pub fn split_quoted(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    current.push(c);
                }
            }
            '"' => {
                in_word = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => match chars.next() {
                            Some(next @ ('"' | '\\')) => current.push(next),
                            Some(next) => {
                                current.push('\\');
                                current.push(next);
                            }
                            None => current.push('\\'),
                        },
                        _ => current.push(c),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            _ => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    words
}

/// Full argument vector for a run, executable tokens first.
pub fn build_argv(rc: &RunConfig, quote_params: bool) -> Vec<String> {
    let delim = if quote_params { "'" } else { "" };
    let instance = rc.instance();

    let mut argv = split_quoted(&rc.execution().executable);
    argv.push(instance.name.clone());
    argv.push(instance.instance_specific_info.clone());
    argv.push(rc.cutoff().to_string());
    argv.push(MAX_RUNLENGTH_SENTINEL.to_string());
    argv.push(rc.seed().to_string());

    for (name, value) in rc.parameters().active_parameters() {
        argv.push(format!("-{}", name));
        argv.push(format!("{}{}{}", delim, value, delim));
    }

    argv
}

/// Reproducible shell rendering of a call, used in logs.
pub fn call_string(rc: &RunConfig, argv: &[String]) -> String {
    format!(
        "cd \"{}\" ; {}",
        rc.execution().execution_dir.display(),
        argv.iter().map(|arg| shell_quote(arg)).join(" ")
    )
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty() && !arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Substitutes the `%pid` token of a kill command template.
pub fn kill_command(template: &str, pid: u32) -> Vec<String> {
    split_quoted(&template.replace("%pid", &pid.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::domain::{
        ExecutionConfig, ParameterConfiguration, ProblemInstance, ProblemInstanceSeedPair,
    };

    fn config(executable: &str) -> RunConfig {
        RunConfig::new(
            ProblemInstanceSeedPair::new(
                Arc::new(ProblemInstance::new("instances/a.cnf", 1).with_specific_info("42")),
                7,
            ),
            10.5,
            Arc::new(ParameterConfiguration::new([("alpha", "0.5"), ("mode", "fast")])),
            Arc::new(ExecutionConfig::new(executable, "/tmp", false, 300.0)),
        )
        .unwrap()
    }

    #[test]
    fn test_split_quoted() {
        assert_eq!(split_quoted("a b  c"), vec!["a", "b", "c"]);
        assert_eq!(
            split_quoted("bash -c \"kill -s TERM -%pid\""),
            vec!["bash", "-c", "kill -s TERM -%pid"]
        );
        assert_eq!(
            split_quoted("python 'my wrapper.py' --x"),
            vec!["python", "my wrapper.py", "--x"]
        );
        assert_eq!(split_quoted(r#"a\ b "x\"y" ''"#), vec!["a b", "x\"y", ""]);
        assert!(split_quoted("   ").is_empty());
    }

    #[test]
    fn test_build_argv_order() {
        let argv = build_argv(&config("python wrapper.py"), false);
        assert_eq!(
            argv,
            vec![
                "python",
                "wrapper.py",
                "instances/a.cnf",
                "42",
                "10.5",
                "2147483647",
                "7",
                "-alpha",
                "0.5",
                "-mode",
                "fast",
            ]
        );
    }

    #[test]
    fn test_build_argv_quoted_params() {
        let argv = build_argv(&config("./run.sh"), true);
        assert_eq!(&argv[6..], &["-alpha", "'0.5'", "-mode", "'fast'"]);
    }

    #[test]
    fn test_call_string_quotes_whitespace() {
        let rc = config("'my solver'");
        let argv = build_argv(&rc, false);
        let call = call_string(&rc, &argv);
        assert!(call.starts_with("cd \"/tmp\" ; 'my solver' instances/a.cnf 42"));
    }

    #[test]
    fn test_execution_id_variable_suffix() {
        let defined = ["AEATK_EXECUTION_UUID", "AEATK_EXECUTION_UUID_SUB_0"];
        let name = execution_id_variable("AEATK_EXECUTION_UUID", |n| defined.contains(&n));
        assert_eq!(name, "AEATK_EXECUTION_UUID_SUB_1");

        let name = execution_id_variable("AEATK_EXECUTION_UUID", |_| false);
        assert_eq!(name, "AEATK_EXECUTION_UUID");
    }

    #[test]
    fn test_kill_command_substitutes_pid() {
        assert_eq!(
            kill_command("bash -c \"kill -s TERM -%pid\"", 1234),
            vec!["bash", "-c", "kill -s TERM -1234"]
        );
        assert_eq!(kill_command("kill -s KILL %pid", 99), vec!["kill", "-s", "KILL", "99"]);
    }
}
