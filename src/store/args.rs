use std::collections::HashMap;
use anyhow::{anyhow, Result};

/// Backend options in the form `name,key=value,key=value`.
#[derive(Debug)]
pub struct Args {
    args: HashMap<String, String>,
}

impl Args {
    pub fn parse(args: &str) -> Result<(&str, Self)> {
        let mut split = args.trim().splitn(2, ',');
        let backend = split.next().unwrap_or("");
        let rest    = split.next().unwrap_or("");

        let mut map = HashMap::new();
        for pair in rest.split(',').filter(|s| !s.is_empty()) {
            match pair.split_once('=') {
                Some((k, v)) => map.insert(k.trim().to_owned(), v.trim().to_owned()),
                None         => return Err(anyhow!("malformed option '{}'", pair)),
            };
        }

        Ok((backend, Self { args: map }))
    }

    pub fn opt(&self, name: &str) -> Option<&str> {
        self.args.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Rejects options the backend does not understand.
    pub fn check(&self, known: &[&str]) -> Result<()> {
        match self.args.keys().find(|k| !known.contains(&k.as_str())) {
            Some(key) => Err(anyhow!("unknown option '{}'", key)),
            None      => Ok(()),
        }
    }
}
