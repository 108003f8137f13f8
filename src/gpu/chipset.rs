// Intel chipset identification for the DRM Testbed
//
// Maps the PCI device id reported by the i915 driver to a platform name
// and graphics generation. Ids missing from the table are unsupported.

use std::fmt;

/// A recognised Intel graphics platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntelChipset {
    pub device_id: u16,         // PCI device id (I915_PARAM_CHIPSET_ID)
    pub platform: &'static str, // Marketing codename, e.g. "skylake"
    pub gen: u8,                // Graphics generation
}

impl fmt::Display for IntelChipset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (gen{}, {:#06x})", self.platform, self.gen, self.device_id)
    }
}

struct Platform {
    name: &'static str,
    gen: u8,
    ids: &'static [u16],
}

const PLATFORMS: &[Platform] = &[
    Platform { name: "i830", gen: 2, ids: &[0x3577, 0x2562, 0x3582, 0x358e] },
    Platform {
        name: "i915",
        gen: 3,
        ids: &[0x2582, 0x258a, 0x2592, 0x2772, 0x27a2, 0x27ae, 0x29b2, 0x29c2, 0x29d2, 0xa001, 0xa011],
    },
    Platform {
        name: "i965",
        gen: 4,
        ids: &[0x2972, 0x2982, 0x2992, 0x29a2, 0x2a02, 0x2a12, 0x2a42, 0x2e02, 0x2e12, 0x2e22, 0x2e32, 0x2e42, 0x2e92],
    },
    Platform { name: "ironlake", gen: 5, ids: &[0x0042, 0x0046] },
    Platform {
        name: "sandybridge",
        gen: 6,
        ids: &[0x0102, 0x0106, 0x010a, 0x0112, 0x0116, 0x0122, 0x0126],
    },
    Platform { name: "ivybridge", gen: 7, ids: &[0x0152, 0x0156, 0x015a, 0x0162, 0x0166, 0x016a] },
    Platform { name: "valleyview", gen: 7, ids: &[0x0f30, 0x0f31, 0x0f32, 0x0f33, 0x0157, 0x0155] },
    Platform {
        name: "haswell",
        gen: 7,
        ids: &[
            0x0402, 0x0406, 0x040a, 0x0412, 0x0416, 0x041a, 0x041e, 0x0422, 0x0426, 0x042a,
            0x0a02, 0x0a06, 0x0a0a, 0x0a0e, 0x0a12, 0x0a16, 0x0a1e, 0x0a22, 0x0a26, 0x0a2e,
            0x0d12, 0x0d16, 0x0d22, 0x0d26, 0x0d2a,
        ],
    },
    Platform {
        name: "broadwell",
        gen: 8,
        ids: &[
            0x1602, 0x1606, 0x160a, 0x160b, 0x160d, 0x160e, 0x1612, 0x1616, 0x161a, 0x161b,
            0x161d, 0x161e, 0x1622, 0x1626, 0x162a, 0x162b, 0x162d, 0x162e,
        ],
    },
    Platform { name: "cherryview", gen: 8, ids: &[0x22b0, 0x22b1, 0x22b2, 0x22b3] },
    Platform {
        name: "skylake",
        gen: 9,
        ids: &[
            0x1902, 0x1906, 0x190a, 0x190b, 0x190e, 0x1912, 0x1913, 0x1915, 0x1916, 0x1917,
            0x191a, 0x191b, 0x191d, 0x191e, 0x1921, 0x1923, 0x1926, 0x1927, 0x192a, 0x192b,
            0x192d, 0x1932, 0x193a, 0x193b, 0x193d,
        ],
    },
    Platform { name: "broxton", gen: 9, ids: &[0x0a84, 0x1a84, 0x1a85, 0x5a84, 0x5a85] },
    Platform {
        name: "kabylake",
        gen: 9,
        ids: &[
            0x5902, 0x5906, 0x5908, 0x590a, 0x590b, 0x590e, 0x5912, 0x5913, 0x5915, 0x5916,
            0x5917, 0x591a, 0x591b, 0x591d, 0x591e, 0x5921, 0x5923, 0x5926, 0x5927, 0x593b,
        ],
    },
    Platform { name: "geminilake", gen: 9, ids: &[0x3184, 0x3185] },
    Platform {
        name: "coffeelake",
        gen: 9,
        ids: &[
            0x3e90, 0x3e91, 0x3e92, 0x3e93, 0x3e94, 0x3e96, 0x3e98, 0x3e99, 0x3e9a, 0x3e9b,
            0x3e9c, 0x3ea0, 0x3ea5, 0x3ea6, 0x3ea7, 0x3ea8, 0x3ea9,
        ],
    },
    Platform { name: "cannonlake", gen: 10, ids: &[0x5a40, 0x5a41, 0x5a42, 0x5a49, 0x5a4a, 0x5a50, 0x5a51, 0x5a52] },
    Platform {
        name: "icelake",
        gen: 11,
        ids: &[0x8a50, 0x8a51, 0x8a52, 0x8a53, 0x8a56, 0x8a57, 0x8a58, 0x8a59, 0x8a5a, 0x8a5b, 0x8a5c, 0x8a5d, 0x8a71],
    },
    Platform {
        name: "tigerlake",
        gen: 12,
        ids: &[0x9a40, 0x9a49, 0x9a59, 0x9a60, 0x9a68, 0x9a70, 0x9a78, 0x9ac0, 0x9ac9, 0x9ad9, 0x9af8],
    },
];

/// Looks a PCI device id up in the platform table
pub fn lookup(device_id: u16) -> Option<IntelChipset> {
    PLATFORMS
        .iter()
        .find(|platform| platform.ids.contains(&device_id))
        .map(|platform| IntelChipset {
            device_id,
            platform: platform.name,
            gen: platform.gen,
        })
}

/// Graphics generation for a device id, if known
pub fn intel_gen(device_id: u16) -> Option<u8> {
    lookup(device_id).map(|chipset| chipset.gen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ids_resolve_to_their_generation() {
        assert_eq!(intel_gen(0x1912), Some(9));
        assert_eq!(intel_gen(0x0166), Some(7));
        assert_eq!(intel_gen(0x9a49), Some(12));
        assert_eq!(lookup(0x3e92).map(|c| c.platform), Some("coffeelake"));
    }

    #[test]
    fn unknown_ids_are_unsupported() {
        assert_eq!(lookup(0x0000), None);
        assert_eq!(intel_gen(0xffff), None);
    }

    #[test]
    fn no_id_belongs_to_two_platforms() {
        for (i, a) in PLATFORMS.iter().enumerate() {
            for b in &PLATFORMS[i + 1..] {
                for id in a.ids {
                    assert!(!b.ids.contains(id), "{:#06x} in {} and {}", id, a.name, b.name);
                }
            }
        }
    }
}
