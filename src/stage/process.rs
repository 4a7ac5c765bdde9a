//! Spawning external stage programs.

use std::fs::File;
use std::io::{self, PipeReader, PipeWriter};
use std::process::{Child, Command, Stdio};

use crate::{Error, Result};

/// A child's standard input.
#[derive(Debug)]
pub(crate) enum ProcessInput {
    Pipe(PipeReader),
    File(File),
}

/// A child's standard output.
#[derive(Debug)]
pub(crate) enum ProcessOutput {
    Pipe(PipeWriter),
    File(File),
}

impl ProcessInput {
    fn try_clone(&self) -> io::Result<Self> {
        Ok(match self {
            Self::Pipe(pipe) => Self::Pipe(pipe.try_clone()?),
            Self::File(file) => Self::File(file.try_clone()?),
        })
    }

    fn into_stdio(self) -> Stdio {
        match self {
            Self::Pipe(pipe) => pipe.into(),
            Self::File(file) => file.into(),
        }
    }
}

impl ProcessOutput {
    fn try_clone(&self) -> io::Result<Self> {
        Ok(match self {
            Self::Pipe(pipe) => Self::Pipe(pipe.try_clone()?),
            Self::File(file) => Self::File(file.try_clone()?),
        })
    }

    fn into_stdio(self) -> Stdio {
        match self {
            Self::Pipe(pipe) => pipe.into(),
            Self::File(file) => file.into(),
        }
    }
}

/// A started child and the program that ended up running.
#[derive(Debug)]
pub(crate) struct Spawned {
    pub child: Child,
    pub program: String,
}

/// Starts the first program in `candidates` that can be spawned.
///
/// Earlier candidates receive duplicates of the endpoints so a failed
/// attempt leaves the originals for the next one. Every `Command` is a
/// temporary dropped right after `spawn`, so this process keeps no copy of
/// the child's endpoints once this returns.
pub(crate) fn spawn_first(
    candidates: &[&str],
    args: &[String],
    stdin: ProcessInput,
    stdout: ProcessOutput,
) -> Result<Spawned> {
    let Some((last, preferred)) = candidates.split_last() else {
        return Err(Error::InvalidConfig("no program configured".into()));
    };

    for program in preferred {
        let attempt = Command::new(program)
            .args(args)
            .stdin(stdin.try_clone()?.into_stdio())
            .stdout(stdout.try_clone()?.into_stdio())
            .stderr(Stdio::inherit())
            .spawn();
        match attempt {
            Ok(child) => {
                log::debug!("started '{program}' (pid {})", child.id());
                return Ok(Spawned {
                    child,
                    program: (*program).to_string(),
                });
            }
            Err(e) => log::warn!("could not start '{program}' ({e}), falling back to '{last}'"),
        }
    }

    let child = Command::new(last)
        .args(args)
        .stdin(stdin.into_stdio())
        .stdout(stdout.into_stdio())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| Error::SpawnFailure {
            program: (*last).to_string(),
            source,
        })?;
    log::debug!("started '{last}' (pid {})", child.id());
    Ok(Spawned {
        child,
        program: (*last).to_string(),
    })
}
