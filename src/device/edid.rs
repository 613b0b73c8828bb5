use anyhow::ensure;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdidInfo {
    pub model: String,
    pub manufacturer: String,
}

impl EdidInfo {
    /// Minimally parse the model and manufacturer from an EDID base block.
    ///
    /// Only the vendor id and the monitor name descriptor are looked at; everything else
    /// the configuration layer needs comes from the connector itself.
    pub fn parse(buffer: &[u8]) -> anyhow::Result<Self> {
        ensure!(buffer.len() >= 128, "edid is too short ({} bytes)", buffer.len());
        ensure!(
            buffer[0..8] == [0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00],
            "edid header is invalid"
        );

        // Manufacturer id is bytes 8-9, big endian.
        // Characters are bits 14-10, 9-5, and 4-0, mapping 1..=26 to A..=Z.
        let manu_id = u16::from_be_bytes([buffer[8], buffer[9]]);
        let letter = |bits: u16| (((bits & 0b11111) as u8) + 64) as char;
        let vendor = [letter(manu_id >> 10), letter(manu_id >> 5), letter(manu_id)];

        let manufacturer = manufacturer_name(vendor);

        // Display descriptors live at bytes 54..=125, 18 bytes each.
        // The first one is always the preferred timing so skip it.
        let model = buffer[72..126]
            .chunks_exact(18)
            .find_map(|desc| {
                let is_monitor_descriptor = desc[0..=1] == [0, 0];
                let is_monitor_name = desc[3] == 0xfc;

                (is_monitor_descriptor && is_monitor_name).then(|| {
                    desc[5..=17]
                        .iter()
                        .take_while(|&&byte| byte != b'\n')
                        .map(|&byte| byte as char)
                        .collect::<String>()
                        .trim_end()
                        .to_string()
                })
            })
            .unwrap_or_else(|| {
                // Fall back to the product code at bytes 10..=11, little endian
                let product_code = u16::from_le_bytes([buffer[10], buffer[11]]);
                format!("{product_code:x}")
            });

        Ok(EdidInfo {
            model,
            manufacturer,
        })
    }
}

fn manufacturer_name(vendor: [char; 3]) -> String {
    let name = match vendor {
        ['A', 'C', 'R'] => "Acer Technologies",
        ['A', 'O', 'C'] => "AOC International",
        ['A', 'P', 'P'] => "Apple Computer Inc",
        ['A', 'U', 'O'] => "AU Optronics",
        ['B', 'N', 'Q'] => "BenQ Corporation",
        ['B', 'O', 'E'] => "BOE Technology",
        ['C', 'M', 'N'] => "Chimei Innolux Corporation",
        ['D', 'E', 'L'] => "Dell Inc.",
        ['E', 'N', 'C'] => "Eizo Nanao Corporation",
        ['G', 'S', 'M'] => "Goldstar Company Ltd",
        ['H', 'W', 'P'] => "Hewlett Packard",
        ['L', 'E', 'N'] => "Lenovo Group Limited",
        ['L', 'G', 'D'] => "LG Display",
        ['N', 'E', 'C'] => "NEC Corporation",
        ['P', 'H', 'L'] => "Philips Consumer Electronics Company",
        ['Q', 'E', 'M'] => "QEMU",
        ['R', 'H', 'T'] => "Red Hat",
        ['S', 'A', 'M'] => "Samsung Electric Company",
        ['S', 'H', 'P'] => "Sharp Corporation",
        ['S', 'N', 'Y'] => "Sony",
        ['V', 'S', 'C'] => "ViewSonic Corporation",
        _ => return vendor.iter().collect(),
    };

    name.to_string()
}
