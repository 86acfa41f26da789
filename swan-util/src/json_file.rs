// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::default::Default;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

fn read_json<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut f = fs::OpenOptions::new().read(true).open(path)?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;

    let mut body = String::new();
    for line in buf.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("//") || trimmed.starts_with('#') {
            body += "\n";
        } else {
            body = body + line + "\n"
        }
    }
    Ok(body)
}

pub trait JsonLoad
where
    Self: DeserializeOwned,
{
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let body = read_json(path)?;
        serde_json::from_str::<Self>(&body).with_context(|| format!("parsing {:?}", path))
    }

    /// Like `load()` but a missing file yields the default value.
    fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self>
    where
        Self: Default,
    {
        let path = path.as_ref();
        match fs::metadata(path) {
            Ok(_) => Self::load(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Default::default()),
            Err(e) => Err(e).with_context(|| format!("stat {:?}", path)),
        }
    }
}

pub trait JsonSave
where
    Self: Default + Serialize,
{
    fn preamble() -> Option<String> {
        None
    }

    fn as_json(&self) -> Result<String> {
        let mut serialized = serde_json::to_string_pretty(&self)?;
        if !serialized.ends_with('\n') {
            serialized += "\n";
        }
        match Self::preamble() {
            Some(pre) => Ok(pre + &serialized),
            None => Ok(serialized),
        }
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        f.write_all(self.as_json()?.as_ref())?;
        Ok(())
    }
}

/// JSON file which is written to `<path>.staging` and renamed into place
/// on commit so that readers never see a partial file.
#[derive(Debug)]
pub struct JsonReportFile<T: JsonSave> {
    pub path: Option<PathBuf>,
    pub staging: PathBuf,
    pub data: T,
}

impl<T: JsonSave> JsonReportFile<T> {
    pub fn new<P: AsRef<Path>>(path_opt: Option<P>) -> Self {
        let (path, staging) = match path_opt {
            Some(p) => {
                let pb = PathBuf::from(p.as_ref());
                let mut st = pb.clone().into_os_string();
                st.push(".staging");
                (Some(pb), PathBuf::from(st))
            }
            None => (None, PathBuf::new()),
        };

        Self {
            path,
            staging,
            data: Default::default(),
        }
    }

    pub fn commit(&self) -> Result<()> {
        let path = match self.path.as_ref() {
            Some(v) => v,
            None => return Ok(()),
        };

        self.data.save(&self.staging)?;
        fs::rename(&self.staging, &path)
            .with_context(|| format!("renaming {:?} to {:?}", &self.staging, path))?;
        Ok(())
    }
}

impl<T: JsonSave + JsonLoad> JsonReportFile<T> {
    /// Opens `path`, loading the existing content if there is any.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = Self::new(Some(path.as_ref()));
        file.data = T::load_or_default(path)?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Rows {
        rows: Vec<String>,
    }

    impl JsonLoad for Rows {}
    impl JsonSave for Rows {
        fn preamble() -> Option<String> {
            Some("// test rows\n".into())
        }
    }

    #[test]
    fn test_report_file_commit_and_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rows.json");

        let mut file = JsonReportFile::<Rows>::open(&path).unwrap();
        assert!(file.data.rows.is_empty());
        file.data.rows.push("a".into());
        file.data.rows.push("b".into());
        file.commit().unwrap();
        assert!(!file.staging.exists());

        let file = JsonReportFile::<Rows>::open(&path).unwrap();
        assert_eq!(file.data.rows, vec!["a", "b"]);
    }

    #[test]
    fn test_load_skips_comments() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rows.json");
        fs::write(&path, "# hash comment\n// slash comment\n{\"rows\": [\"x\"]}\n").unwrap();
        assert_eq!(Rows::load(&path).unwrap().rows, vec!["x"]);
    }
}
