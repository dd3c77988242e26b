//! Filters narrowing discovered devices down to the members of a resource pool.
//!
//! A [`SelectorSet`] is turned into an ordered [`chain`] of [`Selector`]s, one per non-empty
//! criterion. Every selector only keeps the devices it matches, so the result of a chain is the
//! intersection of its selectors.
use std::borrow::Borrow;

use tracing::warn;

use crate::devices::HostDevice;
use crate::resource_config::SelectorSet;

mod range;

pub use range::NameRange;

/// One filtering criterion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    /// PCI vendor IDs
    Vendors(Vec<String>),
    /// PCI device IDs
    Devices(Vec<String>),
    /// Bound drivers
    Drivers(Vec<String>),
    /// PCI addresses, the parent address for auxiliary devices
    PciAddresses(Vec<String>),
    /// PF netdev names with optional VF ranges
    PfNames(Vec<NameRange>),
    /// PF PCI addresses with optional VF ranges
    RootDevices(Vec<NameRange>),
    /// Link types
    LinkTypes(Vec<String>),
    /// DDP profile names
    DdpProfiles(Vec<String>),
    /// InfiniBand partition keys
    PKeys(Vec<String>),
    /// Only RDMA capable devices
    Rdma,
    /// Only devices with a vDPA device of the given type
    VdpaType(String),
    /// Auxiliary device types
    AuxTypes(Vec<String>),
}

impl Selector {
    /// Keeps the devices matched by this selector, in order.
    pub fn filter<D: Borrow<HostDevice>>(&self, devices: Vec<D>) -> Vec<D> {
        devices
            .into_iter()
            .filter(|d| self.matches(d.borrow()))
            .collect()
    }

    /// True when the device satisfies this selector.
    pub fn matches(&self, device: &HostDevice) -> bool {
        let net = device.net();
        match self {
            Selector::Vendors(values) => contains(values, device.vendor()),
            Selector::Devices(values) => contains(values, device.device_code()),
            Selector::Drivers(values) => contains(values, device.driver()),
            Selector::PciAddresses(values) => contains(values, device.pci_addr()),
            Selector::PfNames(rules) => net
                .and_then(|n| n.pf_name.as_deref().map(|name| (name, n.vf_index)))
                .map_or(false, |(name, index)| rules.iter().any(|r| r.matches(name, index))),
            Selector::RootDevices(rules) => net.map_or(false, |n| {
                rules.iter().any(|r| r.matches(&n.pf_addr, n.vf_index))
            }),
            Selector::LinkTypes(values) => net
                .and_then(|n| n.link_type.as_deref())
                .map_or(false, |t| contains(values, t)),
            Selector::DdpProfiles(values) => net
                .and_then(|n| n.ddp_profile.as_deref())
                .map_or(false, |p| contains(values, p)),
            Selector::PKeys(values) => net
                .and_then(|n| n.pkey.as_deref())
                .map_or(false, |k| contains(values, k)),
            Selector::Rdma => device.is_rdma(),
            Selector::VdpaType(vdpa_type) => device
                .vdpa_device()
                .map_or(false, |v| &v.vdpa_type == vdpa_type),
            Selector::AuxTypes(values) => device.aux_type().map_or(false, |t| contains(values, t)),
        }
    }
}

fn contains(values: &[String], value: &str) -> bool {
    values.iter().any(|v| v == value)
}

/// Builds the selectors of a selector set in evaluation order: vendors, devices, drivers, PCI
/// addresses, PF names, root devices, link types, DDP profiles, pkeys, RDMA, vDPA type and
/// auxiliary types. Empty criteria are left out.
pub fn chain(set: &SelectorSet) -> Vec<Selector> {
    let mut chain = Vec::new();
    let device = set.device();
    push_values(&mut chain, &device.vendors, Selector::Vendors);
    push_values(&mut chain, &device.devices, Selector::Devices);
    push_values(&mut chain, &device.drivers, Selector::Drivers);
    push_values(&mut chain, &device.pci_addresses, Selector::PciAddresses);

    if let Some(generic) = set.generic_net() {
        push_rules(&mut chain, &generic.pf_names, Selector::PfNames);
        push_rules(&mut chain, &generic.root_devices, Selector::RootDevices);
        if generic.link_types.len() > 1 {
            warn!(
                link_types = ?generic.link_types,
                "Multiple link types given, a resource pool should contain a single link type"
            );
        }
        push_values(&mut chain, &generic.link_types, Selector::LinkTypes);
    }

    if let SelectorSet::Net(net) = set {
        push_values(&mut chain, &net.ddp_profiles, Selector::DdpProfiles);
        push_values(&mut chain, &net.p_keys, Selector::PKeys);
    }

    if set.generic_net().map_or(false, |g| g.is_rdma) {
        chain.push(Selector::Rdma);
    }

    match set {
        SelectorSet::Net(net) if !net.vdpa_type.is_empty() => {
            chain.push(Selector::VdpaType(net.vdpa_type.clone()))
        }
        SelectorSet::AuxNet(aux) => push_values(&mut chain, &aux.aux_types, Selector::AuxTypes),
        _ => {}
    }
    chain
}

fn push_values(chain: &mut Vec<Selector>, values: &[String], f: fn(Vec<String>) -> Selector) {
    if !values.is_empty() {
        chain.push(f(values.to_vec()));
    }
}

fn push_rules(chain: &mut Vec<Selector>, rules: &[String], f: fn(Vec<NameRange>) -> Selector) {
    if !rules.is_empty() {
        chain.push(f(rules.iter().map(|r| NameRange::parse(r)).collect()));
    }
}

/// Runs the devices through every selector of the chain, stopping as soon as none is left.
pub fn apply<D: Borrow<HostDevice>>(chain: &[Selector], mut devices: Vec<D>) -> Vec<D> {
    for selector in chain {
        if devices.is_empty() {
            break;
        }
        devices = selector.filter(devices);
    }
    devices
}
