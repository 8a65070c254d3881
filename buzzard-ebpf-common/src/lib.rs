#![no_std]

pub mod policy;

/// Name of the TC ingress classifier inside the firewall object.
pub const TC_INGRESS_PROGRAM: &str = "tc_ingress_program";

/// Prefix docker gives the host side of a container's veth pair.
pub const VETH_PREFIX: &str = "veth";
