use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use serde::Deserialize;

use crate::{dependencies::Dependency, exe::RunAndCheck};

const OUTPUT_COLUMNS: &str = "NAME,PATH,TYPE,FSTYPE,LABEL,PARTLABEL,SIZE";

/// One device from `lsblk --json` output, with its children.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockDevice {
    pub name: String,
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub kind: String,
    pub fstype: Option<String>,
    pub label: Option<String>,
    pub partlabel: Option<String>,
    /// Size in bytes (`lsblk -b`).
    pub size: u64,
    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkReport {
    blockdevices: Vec<BlockDevice>,
}

impl BlockDevice {
    pub fn is_partition(&self) -> bool {
        self.kind == "part"
    }

    /// Depth-first search over this device and its children.
    pub fn find(&self, pred: &dyn Fn(&BlockDevice) -> bool) -> Option<&BlockDevice> {
        if pred(self) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(pred))
    }
}

/// Lists a disk and its partitions.
pub fn get(device_path: impl AsRef<Path>) -> Result<BlockDevice, Error> {
    let output = Dependency::Lsblk
        .cmd()
        .arg("--json")
        .arg("--bytes")
        .arg("--output")
        .arg(OUTPUT_COLUMNS)
        .arg(device_path.as_ref())
        .output_and_check()
        .context("Failed to execute lsblk")?;

    parse(&output)?
        .into_iter()
        .next()
        .with_context(|| format!("lsblk returned no device for '{}'", device_path.as_ref().display()))
}

/// Lists all block devices on the host.
pub fn list() -> Result<Vec<BlockDevice>, Error> {
    let output = Dependency::Lsblk
        .cmd()
        .arg("--json")
        .arg("--bytes")
        .arg("--output")
        .arg(OUTPUT_COLUMNS)
        .output_and_check()
        .context("Failed to execute lsblk")?;

    parse(&output)
}

fn parse(output: &str) -> Result<Vec<BlockDevice>, Error> {
    let report: LsblkReport =
        serde_json::from_str(output).context("Failed to parse lsblk JSON output")?;
    Ok(report.blockdevices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const SAMPLE: &str = indoc! {r#"
        {
           "blockdevices": [
              {
                 "name": "sda",
                 "path": "/dev/sda",
                 "type": "disk",
                 "fstype": null,
                 "label": null,
                 "partlabel": null,
                 "size": 53687091200,
                 "children": [
                    {
                       "name": "sda1",
                       "path": "/dev/sda1",
                       "type": "part",
                       "fstype": "vfat",
                       "label": "UEFI",
                       "partlabel": "UEFI",
                       "size": 2147483648
                    },
                    {
                       "name": "sda2",
                       "path": "/dev/sda2",
                       "type": "part",
                       "fstype": "btrfs",
                       "label": "root1",
                       "partlabel": "root1",
                       "size": 12884901888
                    }
                 ]
              }
           ]
        }
    "#};

    #[test]
    fn test_parse() {
        let devices = parse(SAMPLE).unwrap();
        assert_eq!(devices.len(), 1);
        let disk = &devices[0];
        assert_eq!(disk.kind, "disk");
        assert_eq!(disk.children.len(), 2);
        assert_eq!(disk.children[1].partlabel.as_deref(), Some("root1"));
        assert_eq!(disk.children[0].size, 2147483648);
    }

    #[test]
    fn test_find() {
        let devices = parse(SAMPLE).unwrap();
        let root1 = devices[0]
            .find(&|d| d.partlabel.as_deref() == Some("root1"))
            .unwrap();
        assert_eq!(root1.path, Path::new("/dev/sda2"));
        assert!(devices[0].find(&|d| d.name == "sda9").is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        parse("not json").unwrap_err();
    }
}
