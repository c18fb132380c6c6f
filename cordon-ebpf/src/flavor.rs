//! Attachment flavor.
//!
//! Mirrors the specialization the userland applies when it attaches a
//! program instance: which direction the hook faces, whether the
//! interface is a workload veth or a host data interface, and whether
//! DSR or the overlay tunnel are in play.

/// Packet travels toward the host namespace (ingress hooks).
pub const F_TO_HOST: u32 = 0x1;
/// Attached to a workload interface (veth) rather than a host one.
pub const F_WORKLOAD: u32 = 0x2;
/// Direct server return enabled for this node.
pub const F_DSR: u32 = 0x4;
/// Attached to the overlay tunnel device itself.
pub const F_TUNNEL: u32 = 0x8;
/// Default endpoint-to-host action is drop: workload traffic to a
/// local host address is blocked even when policy allowed it.
pub const F_DROP_WL_TO_HOST: u32 = 0x10;

#[derive(Clone, Copy)]
pub struct Flavor(u32);

impl Flavor {
    #[inline(always)]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline(always)]
    pub const fn to_host(self) -> bool {
        self.0 & F_TO_HOST != 0
    }

    #[inline(always)]
    pub const fn from_host(self) -> bool {
        !self.to_host()
    }

    #[inline(always)]
    pub const fn workload_iface(self) -> bool {
        self.0 & F_WORKLOAD != 0
    }

    #[inline(always)]
    pub const fn host_iface(self) -> bool {
        !self.workload_iface()
    }

    #[inline(always)]
    pub const fn dsr(self) -> bool {
        self.0 & F_DSR != 0
    }

    #[inline(always)]
    pub const fn tunnel(self) -> bool {
        self.0 & F_TUNNEL != 0
    }

    #[inline(always)]
    pub const fn drop_workload_to_host(self) -> bool {
        self.0 & F_DROP_WL_TO_HOST != 0
    }

    /// Packets leaving a workload, entering the host (veth ingress).
    #[inline(always)]
    pub const fn from_workload(self) -> bool {
        self.to_host() && self.workload_iface()
    }

    /// Packets about to be delivered to a workload (veth egress).
    #[inline(always)]
    pub const fn to_workload(self) -> bool {
        self.from_host() && self.workload_iface()
    }

    /// Packets arriving from the fabric (data interface ingress).
    #[inline(always)]
    pub const fn from_host_iface(self) -> bool {
        self.to_host() && self.host_iface()
    }

    /// Packets leaving through the fabric (data interface egress).
    #[inline(always)]
    pub const fn to_host_iface(self) -> bool {
        self.from_host() && self.host_iface()
    }

    /// Should this hook attempt decap of overlay packets?
    #[inline(always)]
    pub const fn should_decap(self) -> bool {
        self.from_host_iface()
    }

    /// Should a DNAT to a remote backend encap here?
    #[inline(always)]
    pub const fn dnat_should_encap(self) -> bool {
        self.to_host() && !self.tunnel()
    }

    /// Should SNATed return traffic be encapped back to the client's
    /// node from this hook?
    #[inline(always)]
    pub const fn dnat_return_should_encap(self) -> bool {
        self.from_workload()
    }
}
