// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

pub trait JsonLoad
where
    Self: DeserializeOwned,
{
    /// Called after deserialization to rebuild derived state.
    fn loaded(&mut self) -> Result<()> {
        Ok(())
    }

    fn from_json(body: &[u8]) -> Result<Self> {
        let mut data = serde_json::from_slice::<Self>(body)?;
        data.loaded()?;
        Ok(data)
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let buf = fs::read(path).with_context(|| format!("reading {:?}", path))?;
        Self::from_json(&buf).with_context(|| format!("parsing {:?}", path))
    }
}

pub trait JsonSave
where
    Self: Serialize,
{
    fn as_json(&self) -> Result<String> {
        let mut serialized = serde_json::to_string_pretty(&self)?;
        if !serialized.ends_with("\n") {
            serialized += "\n";
        }
        Ok(serialized)
    }

    /// Write to PATH.staging and rename over PATH so that readers never see
    /// a partial file.
    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let staging = staging_path(path);

        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging)
            .with_context(|| format!("opening {:?}", &staging))?;
        f.write_all(self.as_json()?.as_ref())?;
        drop(f);

        fs::rename(&staging, path)
            .with_context(|| format!("renaming {:?} to {:?}", &staging, path))?;
        Ok(())
    }
}

pub fn staging_path(path: &Path) -> PathBuf {
    let mut st: OsString = path.as_os_str().to_owned();
    st.push(".staging");
    PathBuf::from(st)
}
