//! Canonical kernel cmdline composition. Argument order is part of the
//! contract: `root=`, the `rd.luks.*` pairs per volume, `rw`, then user
//! args.

use nbc_api::config::LuksVolumeRecord;

use super::RootIdentity;

pub fn compose(
    root: &RootIdentity,
    luks_volumes: &[LuksVolumeRecord],
    extra_args: &[String],
) -> String {
    let mut args: Vec<String> = Vec::new();

    match root {
        RootIdentity::PartitionUuid(uuid) => args.push(format!("root=UUID={uuid}")),
        RootIdentity::Mapper(name) => args.push(format!("root=/dev/mapper/{name}")),
    }

    for volume in luks_volumes {
        args.push(format!("rd.luks.uuid={}", volume.luks_uuid));
        args.push(format!(
            "rd.luks.name={}={}",
            volume.luks_uuid, volume.mapper
        ));
    }

    args.push("rw".to_owned());
    args.extend(extra_args.iter().cloned());

    args.join(" ")
}
