/// Native module evaluates runs by starting the target algorithm as a
/// local child process, supervising it through its process group and
/// parsing its result line from stdout.
pub mod command;
pub mod evaluator;
pub mod kill;
pub mod output;
pub mod run;
pub mod tokens;
