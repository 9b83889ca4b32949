//! Block I/O resource: proportional weights over the blkio hierarchy.

use std::sync::Arc;

use nix::unistd::{Gid, Pid, Uid};

use super::{no_handled_event, undo_create, ResourceHandler, ResourceHandlerFactory, ResourceKind};
use crate::cgroups::{CgroupController, CgroupFactory, CgroupHierarchy, ControllerFactory};
use crate::error::{Error, Result};
use crate::notifications::{EventCallback, EventFdNotifications, Handle};
use crate::spec_types::{
    BlockIoSpec, ContainerSpec, DeviceWeight, EventSpec, MachineSpec, StatsType, UpdatePolicy,
};
use crate::stats::{BlkioDeviceStat, ContainerStats};

const BLKIO_WEIGHT: &str = "blkio.weight";
const BLKIO_WEIGHT_DEVICE: &str = "blkio.weight_device";
const BLKIO_IO_SERVICED: &str = "blkio.io_serviced";
const BLKIO_IO_SERVICE_BYTES: &str = "blkio.io_service_bytes";

const DEFAULT_WEIGHT: u64 = 500;
const MIN_WEIGHT: u64 = 10;
const MAX_WEIGHT: u64 = 1000;

pub struct BlockIoHandlerFactory {
    controllers: ControllerFactory,
}

impl BlockIoHandlerFactory {
    pub fn new(
        cgroups: Arc<CgroupFactory>,
        notifications: Arc<EventFdNotifications>,
    ) -> Result<Self> {
        if !cgroups.is_mounted(CgroupHierarchy::Blkio) {
            return Err(Error::not_found(
                "blockio resource depends on the blkio cgroup hierarchy",
            ));
        }
        Ok(Self {
            controllers: ControllerFactory::new(CgroupHierarchy::Blkio, cgroups, notifications),
        })
    }
}

impl ResourceHandlerFactory for BlockIoHandlerFactory {
    fn kind(&self) -> ResourceKind {
        ResourceKind::BlockIo
    }

    fn create(
        &self,
        container_name: &str,
        spec: &ContainerSpec,
    ) -> Result<Box<dyn ResourceHandler>> {
        let controller = self.controllers.create(container_name)?;
        let mut handler = BlockIoHandler {
            container_name: container_name.to_string(),
            controller,
        };
        match handler.update(spec, UpdatePolicy::Replace) {
            Ok(()) => Ok(Box::new(handler)),
            Err(err) => Err(undo_create(handler, BlockIoHandler::teardown, err)),
        }
    }

    fn get(&self, container_name: &str) -> Result<Box<dyn ResourceHandler>> {
        let controller = self.controllers.get(container_name)?;
        Ok(Box::new(BlockIoHandler {
            container_name: container_name.to_string(),
            controller,
        }))
    }
}

pub struct BlockIoHandler {
    container_name: String,
    controller: CgroupController,
}

impl BlockIoHandler {
    fn fill_from_current(&self, mut spec: BlockIoSpec) -> Result<BlockIoSpec> {
        if spec.weight.is_none() {
            spec.weight = Some(self.controller.get_param_int(BLKIO_WEIGHT)? as u64);
        }
        Ok(spec)
    }

    fn fill_defaults(mut spec: BlockIoSpec) -> BlockIoSpec {
        spec.weight.get_or_insert(DEFAULT_WEIGHT);
        spec
    }

    fn validate(spec: &BlockIoSpec) -> Result<()> {
        let weights = spec
            .weight
            .iter()
            .chain(spec.device_weights.iter().map(|d| &d.weight));
        for weight in weights {
            if !(MIN_WEIGHT..=MAX_WEIGHT).contains(weight) {
                return Err(Error::invalid_argument(format!(
                    "blockio weight must be between {MIN_WEIGHT} and {MAX_WEIGHT}, got {weight}"
                )));
            }
        }
        Ok(())
    }

    fn apply(&self, spec: &BlockIoSpec) -> Result<()> {
        if let Some(weight) = spec.weight {
            self.controller.set_param_int(BLKIO_WEIGHT, weight as i64)?;
        }
        for device in &spec.device_weights {
            self.controller.set_param_string(
                BLKIO_WEIGHT_DEVICE,
                &format!("{}:{} {}", device.major, device.minor, device.weight),
            )?;
        }
        Ok(())
    }

    fn read_device_stats(&self, file: &str) -> Result<(Vec<BlkioDeviceStat>, u64)> {
        let mut entries = Vec::new();
        let mut total = 0;
        for line in self.controller.get_param_lines(file)? {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                ["Total", value] => {
                    total = value.parse().map_err(|_| malformed(&line, file))?;
                }
                [device, op, value] => {
                    let (major, minor) = device
                        .split_once(':')
                        .ok_or_else(|| malformed(&line, file))?;
                    entries.push(BlkioDeviceStat {
                        major: major.parse().map_err(|_| malformed(&line, file))?,
                        minor: minor.parse().map_err(|_| malformed(&line, file))?,
                        op: (*op).to_string(),
                        value: value.parse().map_err(|_| malformed(&line, file))?,
                    });
                }
                _ => return Err(malformed(&line, file)),
            }
        }
        Ok((entries, total))
    }

    fn teardown(self) -> Result<()> {
        self.controller.destroy()
    }
}

fn malformed(line: &str, file: &str) -> Error {
    Error::failed_precondition(format!("malformed entry \"{line}\" in {file}"))
}

impl ResourceHandler for BlockIoHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::BlockIo
    }

    fn container_name(&self) -> &str {
        &self.container_name
    }

    fn update(&mut self, spec: &ContainerSpec, policy: UpdatePolicy) -> Result<()> {
        let provided = spec.blockio.clone().unwrap_or_default();
        let full = match policy {
            UpdatePolicy::Diff => self.fill_from_current(provided.clone())?,
            UpdatePolicy::Replace => Self::fill_defaults(provided.clone()),
        };
        Self::validate(&full)?;

        match policy {
            UpdatePolicy::Diff => self.apply(&provided),
            UpdatePolicy::Replace => self.apply(&full),
        }
    }

    fn stats(&self, stats_type: StatsType, output: &mut ContainerStats) -> Result<()> {
        let (serviced, serviced_total) = self.read_device_stats(BLKIO_IO_SERVICED)?;
        let (service_bytes, bytes_total) = self.read_device_stats(BLKIO_IO_SERVICE_BYTES)?;
        output.blockio.serviced_total = serviced_total;
        output.blockio.service_bytes_total = bytes_total;
        if stats_type == StatsType::Full {
            output.blockio.serviced = serviced;
            output.blockio.service_bytes = service_bytes;
        }
        Ok(())
    }

    fn spec(&self, output: &mut ContainerSpec) -> Result<()> {
        let mut device_weights = Vec::new();
        for line in self.controller.get_param_lines(BLKIO_WEIGHT_DEVICE)? {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if let [device, weight] = fields.as_slice() {
                let (major, minor) = device
                    .split_once(':')
                    .ok_or_else(|| malformed(&line, BLKIO_WEIGHT_DEVICE))?;
                device_weights.push(DeviceWeight {
                    major: major.parse().map_err(|_| malformed(&line, BLKIO_WEIGHT_DEVICE))?,
                    minor: minor.parse().map_err(|_| malformed(&line, BLKIO_WEIGHT_DEVICE))?,
                    weight: weight
                        .parse()
                        .map_err(|_| malformed(&line, BLKIO_WEIGHT_DEVICE))?,
                });
            }
        }
        output.blockio = Some(BlockIoSpec {
            weight: Some(self.controller.get_param_int(BLKIO_WEIGHT)? as u64),
            device_weights,
        });
        Ok(())
    }

    fn enter(&self, tids: &[Pid]) -> Result<()> {
        for tid in tids {
            self.controller.enter(*tid)?;
        }
        Ok(())
    }

    fn delegate(&self, uid: Option<Uid>, gid: Option<Gid>) -> Result<()> {
        self.controller.delegate(uid, gid)
    }

    fn destroy(self: Box<Self>) -> Result<()> {
        (*self).teardown()
    }

    fn register_notification(
        &self,
        _event: &EventSpec,
        _callback: EventCallback,
    ) -> Result<Handle> {
        Err(no_handled_event())
    }

    fn populate_machine_spec(&self, spec: &mut MachineSpec) -> Result<()> {
        self.controller.populate_machine_spec(spec);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::error::ErrorKind;
    use crate::kernel::{KernelOps, TestKernelOps};
    use crate::notifications::ActiveNotifications;
    use crate::test_util::set_fixture;

    fn make_factory(tmp: &Path) -> BlockIoHandlerFactory {
        let kernel: Arc<dyn KernelOps> = Arc::new(TestKernelOps::new());
        fs::create_dir_all(tmp.join("blkio")).unwrap();
        let cgroups = Arc::new(CgroupFactory::from_mounts(
            &[(CgroupHierarchy::Blkio, tmp.join("blkio"))],
            Arc::clone(&kernel),
        ));
        let notifications = Arc::new(
            EventFdNotifications::new(Arc::new(ActiveNotifications::default()), kernel).unwrap(),
        );
        BlockIoHandlerFactory::new(cgroups, notifications).unwrap()
    }

    #[test]
    fn test_update_replace_writes_default_weight() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = make_factory(tmp.path());
        let dir = tmp.path().join("blkio/test");
        fs::create_dir_all(&dir).unwrap();
        set_fixture(&dir, BLKIO_WEIGHT, "").unwrap();

        let mut handler = factory.get("/test").unwrap();
        handler
            .update(&ContainerSpec::default(), UpdatePolicy::Replace)
            .unwrap();
        assert_eq!(fs::read_to_string(dir.join(BLKIO_WEIGHT)).unwrap(), "500");
    }

    #[test]
    fn test_update_writes_device_weights() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = make_factory(tmp.path());
        let dir = tmp.path().join("blkio/test");
        fs::create_dir_all(&dir).unwrap();
        set_fixture(&dir, BLKIO_WEIGHT, "500").unwrap();
        set_fixture(&dir, BLKIO_WEIGHT_DEVICE, "").unwrap();

        let mut handler = factory.get("/test").unwrap();
        let spec = ContainerSpec {
            blockio: Some(BlockIoSpec {
                weight: Some(500),
                device_weights: vec![DeviceWeight {
                    major: 8,
                    minor: 16,
                    weight: 200,
                }],
            }),
            ..Default::default()
        };
        handler.update(&spec, UpdatePolicy::Diff).unwrap();
        assert_eq!(
            fs::read_to_string(dir.join(BLKIO_WEIGHT_DEVICE)).unwrap(),
            "8:16 200"
        );
    }

    #[test]
    fn test_update_rejects_out_of_range_weight() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = make_factory(tmp.path());
        let dir = tmp.path().join("blkio/test");
        fs::create_dir_all(&dir).unwrap();
        set_fixture(&dir, BLKIO_WEIGHT, "500").unwrap();

        let mut handler = factory.get("/test").unwrap();
        let spec = ContainerSpec {
            blockio: Some(BlockIoSpec {
                weight: Some(5000),
                device_weights: vec![],
            }),
            ..Default::default()
        };
        let err = handler.update(&spec, UpdatePolicy::Diff).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_stats_totals_and_devices() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = make_factory(tmp.path());
        let dir = tmp.path().join("blkio/test");
        fs::create_dir_all(&dir).unwrap();
        set_fixture(
            &dir,
            BLKIO_IO_SERVICED,
            "8:0 Read 100\n8:0 Write 50\nTotal 150\n",
        )
        .unwrap();
        set_fixture(
            &dir,
            BLKIO_IO_SERVICE_BYTES,
            "8:0 Read 4096\nTotal 4096\n",
        )
        .unwrap();

        let handler = factory.get("/test").unwrap();

        let mut summary = ContainerStats::default();
        handler.stats(StatsType::Summary, &mut summary).unwrap();
        assert_eq!(summary.blockio.serviced_total, 150);
        assert_eq!(summary.blockio.service_bytes_total, 4096);
        assert!(summary.blockio.serviced.is_empty());

        let mut full = ContainerStats::default();
        handler.stats(StatsType::Full, &mut full).unwrap();
        assert_eq!(full.blockio.serviced.len(), 2);
        assert_eq!(full.blockio.serviced[0].major, 8);
        assert_eq!(full.blockio.serviced[0].op, "Read");
        assert_eq!(full.blockio.serviced[0].value, 100);
        assert_eq!(full.blockio.service_bytes.len(), 1);
    }

    #[test]
    fn test_stats_malformed_line() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = make_factory(tmp.path());
        let dir = tmp.path().join("blkio/test");
        fs::create_dir_all(&dir).unwrap();
        set_fixture(&dir, BLKIO_IO_SERVICED, "what even is this line here\n").unwrap();
        set_fixture(&dir, BLKIO_IO_SERVICE_BYTES, "").unwrap();

        let handler = factory.get("/test").unwrap();
        let mut stats = ContainerStats::default();
        let err = handler.stats(StatsType::Summary, &mut stats).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    }

    #[test]
    fn test_spec_reads_device_weights() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = make_factory(tmp.path());
        let dir = tmp.path().join("blkio/test");
        fs::create_dir_all(&dir).unwrap();
        set_fixture(&dir, BLKIO_WEIGHT, "750").unwrap();
        set_fixture(&dir, BLKIO_WEIGHT_DEVICE, "8:0 300\n").unwrap();

        let handler = factory.get("/test").unwrap();
        let mut spec = ContainerSpec::default();
        handler.spec(&mut spec).unwrap();
        let blockio = spec.blockio.unwrap();
        assert_eq!(blockio.weight, Some(750));
        assert_eq!(
            blockio.device_weights,
            vec![DeviceWeight {
                major: 8,
                minor: 0,
                weight: 300
            }]
        );
    }
}
