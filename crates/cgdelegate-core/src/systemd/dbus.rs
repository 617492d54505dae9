//! systemd manager client over the system bus

use std::sync::Mutex;

use tracing::debug;
use zbus::blocking::Connection;
use zbus::proxy;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, Value};

use super::properties::{parse_version, Property, PropertyValue};
use super::{NO_SUCH_UNIT_ERROR, UNIT_EXISTS_ERROR, UNIT_MODE_REPLACE};
use crate::error::{CgroupError, Result};

#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait Manager {
    fn start_transient_unit(
        &self,
        name: &str,
        mode: &str,
        properties: &[(&str, Value<'_>)],
        aux: &[(&str, Vec<(&str, Value<'_>)>)],
    ) -> zbus::Result<OwnedObjectPath>;

    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn set_unit_properties(
        &self,
        name: &str,
        runtime: bool,
        properties: &[(&str, Value<'_>)],
    ) -> zbus::Result<()>;

    fn subscribe(&self) -> zbus::Result<()>;

    #[zbus(signal)]
    fn job_removed(&self, id: u32, job: ObjectPath<'_>, unit: &str, result: &str)
        -> zbus::Result<()>;

    #[zbus(property)]
    fn version(&self) -> zbus::Result<String>;
}

/// The operations the cgroup manager needs from systemd
pub trait SystemdClient: Send + Sync {
    /// Release number of the running systemd
    fn version(&self) -> Result<u32>;

    /// Start a transient unit and wait for its start job to finish
    ///
    /// A unit that already exists counts as started.
    fn start_transient_unit(&self, unit: &str, properties: &[Property]) -> Result<()>;

    /// Stop a unit and wait for its stop job; a missing unit counts as stopped
    fn stop_unit(&self, unit: &str) -> Result<()>;

    /// Change properties of a running unit
    ///
    /// With `runtime` set, nothing is persisted across daemon reloads.
    fn set_unit_properties(&self, unit: &str, runtime: bool, properties: &[Property])
        -> Result<()>;
}

fn to_value(value: &PropertyValue) -> Value<'_> {
    match value {
        PropertyValue::Bool(v) => Value::from(*v),
        PropertyValue::U64(v) => Value::from(*v),
        PropertyValue::Str(v) => Value::from(v.as_str()),
        PropertyValue::U32Array(v) => Value::from(v.clone()),
        PropertyValue::Bytes(v) => Value::from(v.clone()),
        PropertyValue::DeviceAllow(v) => Value::from(v.clone()),
    }
}

fn to_dbus(properties: &[Property]) -> Vec<(&str, Value<'_>)> {
    properties
        .iter()
        .map(|p| (p.name.as_str(), to_value(&p.value)))
        .collect()
}

fn is_method_error(err: &zbus::Error, name: &str) -> bool {
    matches!(err, zbus::Error::MethodError(error_name, _, _) if error_name.as_str() == name)
}

/// [`SystemdClient`] talking to systemd on the system bus
///
/// The bus connection is opened on first use.
#[derive(Default)]
pub struct DbusClient {
    proxy: Mutex<Option<ManagerProxyBlocking<'static>>>,
}

impl DbusClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn proxy(&self) -> Result<ManagerProxyBlocking<'static>> {
        let mut guard = self
            .proxy
            .lock()
            .map_err(|_| CgroupError::Systemd("D-Bus connection lock poisoned".to_string()))?;

        if let Some(proxy) = guard.as_ref() {
            return Ok(proxy.clone());
        }

        let connection = Connection::system()?;
        let proxy = ManagerProxyBlocking::new(&connection)?;
        // Job signals are only delivered to subscribed clients
        proxy.subscribe()?;
        debug!("Connected to systemd on the system bus");

        *guard = Some(proxy.clone());
        Ok(proxy)
    }

    fn wait_for_job(signals: JobRemovedIterator, job: &OwnedObjectPath) -> Result<()> {
        for signal in signals {
            let args = signal.args()?;
            if args.job().as_str() != job.as_str() {
                continue;
            }

            let result: &str = args.result();
            return if result == "done" {
                Ok(())
            } else {
                Err(CgroupError::Systemd(format!(
                    "job {} for unit {} finished with result {}",
                    job.as_str(),
                    args.unit(),
                    result
                )))
            };
        }

        Err(CgroupError::Systemd(format!(
            "signal stream closed before job {} finished",
            job.as_str()
        )))
    }
}

impl SystemdClient for DbusClient {
    fn version(&self) -> Result<u32> {
        parse_version(&self.proxy()?.version()?)
    }

    fn start_transient_unit(&self, unit: &str, properties: &[Property]) -> Result<()> {
        let proxy = self.proxy()?;
        // Subscribe before starting so the job signal can't be missed
        let signals = proxy.receive_job_removed()?;

        match proxy.start_transient_unit(unit, UNIT_MODE_REPLACE, &to_dbus(properties), &[]) {
            Ok(job) => Self::wait_for_job(signals, &job),
            Err(e) if is_method_error(&e, UNIT_EXISTS_ERROR) => {
                debug!("Unit {} already exists", unit);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn stop_unit(&self, unit: &str) -> Result<()> {
        let proxy = self.proxy()?;
        let signals = proxy.receive_job_removed()?;

        match proxy.stop_unit(unit, UNIT_MODE_REPLACE) {
            Ok(job) => Self::wait_for_job(signals, &job),
            Err(e) if is_method_error(&e, NO_SUCH_UNIT_ERROR) => {
                debug!("Unit {} does not exist, nothing to stop", unit);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_unit_properties(
        &self,
        unit: &str,
        runtime: bool,
        properties: &[Property],
    ) -> Result<()> {
        self.proxy()?
            .set_unit_properties(unit, runtime, &to_dbus(properties))?;
        Ok(())
    }
}
