//! ATA command mnemonics for diagnostics and trace logs
//!
//! Opcode naming follows tables B.3/B.4 of ACS-3. A handful of opcodes
//! dispatch on the feature register and get a secondary lookup.

/// Reserved opcode
const RESERVED: &str = "[RESERVED]";
/// Vendor specific opcode
const VENDOR: &str = "[VENDOR SPECIFIC]";
/// Reserved for Serial ATA
const RESERVED_SA: &str = "[RESERVED FOR SERIAL ATA]";
/// Reserved for CompactFlash
const RESERVED_CF: &str = "[RESERVED FOR COMPACTFLASH ASSOCIATION]";

/// Name of the ATA command with the given opcode and feature register.
///
/// For most opcodes the feature register is ignored; NOP, DOWNLOAD MICROCODE,
/// SMART, DEVICE CONFIGURATION, SET FEATURES and SET MAX use it to select a
/// subcommand.
#[expect(clippy::too_many_lines)]
pub(crate) fn command_name(opcode: u8, feature: u8) -> &'static str {
    match opcode {
        0x00 => match feature {
            0x00 => "NOP [Abort queued commands]",
            0x01 => "NOP [Don't abort queued commands] [OBS-ACS-2]",
            _ => "NOP [Reserved subcommand] [OBS-ACS-2]",
        },
        0x03 => "CFA REQUEST EXTENDED ERROR",
        0x06 => "DATA SET MANAGEMENT",
        0x08 => "DEVICE RESET",
        0x0B => "REQUEST SENSE DATA EXT",
        0x10 => "RECALIBRATE [OBS-4]",
        0x11..=0x1F => "RECALIBRATE [RET-4]",
        0x20 => "READ SECTOR(S)",
        0x21 => "READ SECTOR(S) [OBS-5]",
        0x22 => "READ LONG [OBS-4]",
        0x23 => "READ LONG (w/o retry) [OBS-4]",
        0x24 => "READ SECTOR(S) EXT",
        0x25 => "READ DMA EXT",
        0x26 => "READ DMA QUEUED EXT [OBS-ACS-2]",
        0x27 => "READ NATIVE MAX ADDRESS EXT [OBS-ACS-3]",
        0x29 => "READ MULTIPLE EXT",
        0x2A => "READ STREAM DMA",
        0x2B => "READ STREAM",
        0x2F => "READ LOG EXT",
        0x30 => "WRITE SECTOR(S)",
        0x31 => "WRITE SECTOR(S) (w/o retry) [OBS-5]",
        0x32 => "WRITE LONG [OBS-4]",
        0x33 => "WRITE LONG (w/o retry) [OBS-4]",
        0x34 => "WRITE SECTORS(S) EXT",
        0x35 => "WRITE DMA EXT",
        0x36 => "WRITE DMA QUEUED EXT [OBS-ACS-2]",
        0x37 => "SET NATIVE MAX ADDRESS EXT [OBS-ACS-3]",
        0x38 => "CFA WRITE SECTORS WITHOUT ERASE",
        0x39 => "WRITE MULTIPLE EXT",
        0x3A => "WRITE STREAM DMA",
        0x3B => "WRITE STREAM",
        0x3C => "WRITE VERIFY [OBS-4]",
        0x3D => "WRITE DMA FUA EXT",
        0x3E => "WRITE DMA QUEUED FUA EXT [OBS-ACS-2]",
        0x3F => "WRITE LOG EXT",
        0x40 => "READ VERIFY SECTOR(S)",
        0x41 => "READ VERIFY SECTOR(S) (w/o retry) [OBS-5]",
        0x42 => "READ VERIFY SECTOR(S) EXT",
        0x45 => "WRITE UNCORRECTABLE EXT",
        0x47 => "READ LOG DMA EXT",
        0x50 => "FORMAT TRACK [OBS-4]",
        0x51 => "CONFIGURE STREAM",
        0x57 => "WRITE LOG DMA EXT",
        0x5B => "TRUSTED NON-DATA",
        0x5C => "TRUSTED RECEIVE",
        0x5D => "TRUSTED RECEIVE DMA",
        0x5E => "TRUSTED SEND",
        0x5F => "TRUSTED SEND DMA",
        0x60 => "READ FPDMA QUEUED",
        0x61 => "WRITE FPDMA QUEUED",
        0x63 => "NCQ QUEUE MANAGEMENT",
        0x64 => "SEND FPDMA QUEUED",
        0x65 => "RECEIVE FPDMA QUEUED",
        0x62 | 0x66 | 0x67 => RESERVED_SA,
        0x70 => "SEEK [OBS-7]",
        0x77 => "SET DATE & TIME EXT",
        0x78 => "ACCESSIBLE MAX ADDRESS CONFIGURATION",
        0x71..=0x76 | 0x79..=0x7F => "SEEK [RET-4]",
        0x87 => "CFA TRANSLATE SECTOR [VS IF NO CFA]",
        0x80..=0x86 | 0x88..=0x8F => VENDOR,
        0x90 => "EXECUTE DEVICE DIAGNOSTIC",
        0x91 => "INITIALIZE DEVICE PARAMETERS [OBS-6]",
        0x92 => match feature {
            0x01 => "DOWNLOAD MICROCODE [Temporary] [OBS-8]",
            0x03 => "DOWNLOAD MICROCODE [Save with offsets]",
            0x07 => "DOWNLOAD MICROCODE [Save]",
            0x0E => "DOWNLOAD MICROCODE [Save for future use]",
            0x0F => "DOWNLOAD MICROCODE [Activate]",
            _ => "DOWNLOAD MICROCODE [Reserved subcommand]",
        },
        0x93 => "DOWNLOAD MICROCODE DMA",
        0x94 => "STANDBY IMMEDIATE [RET-4]",
        0x95 => "IDLE IMMEDIATE [RET-4]",
        0x96 => "STANDBY [RET-4]",
        0x97 => "IDLE [RET-4]",
        0x98 => "CHECK POWER MODE [RET-4]",
        0x99 => "SLEEP [RET-4]",
        0x9A => VENDOR,
        0xA0 => "PACKET",
        0xA1 => "IDENTIFY PACKET DEVICE",
        0xA2 => "SERVICE [OBS-ACS-2]",
        0xB0 => match feature {
            0xD0 => "SMART READ DATA",
            0xD1 => "SMART READ ATTRIBUTE THRESHOLDS [OBS-4]",
            0xD2 => "SMART ENABLE/DISABLE ATTRIBUTE AUTOSAVE",
            0xD3 => "SMART SAVE ATTRIBUTE VALUES [OBS-6]",
            0xD4 => "SMART EXECUTE OFF-LINE IMMEDIATE",
            0xD5 => "SMART READ LOG",
            0xD6 => "SMART WRITE LOG",
            0xD7 => "SMART WRITE ATTRIBUTE THRESHOLDS [NS, OBS-4]",
            0xD8 => "SMART ENABLE OPERATIONS",
            0xD9 => "SMART DISABLE OPERATIONS",
            0xDA => "SMART RETURN STATUS",
            0xDB => "SMART EN/DISABLE AUTO OFFLINE [NS (SFF-8035i)]",
            0xE0.. => "SMART [Vendor specific subcommand]",
            _ => "SMART [Reserved subcommand]",
        },
        0xB1 => match feature {
            0xC0 => "DEVICE CONFIGURATION RESTORE [OBS-ACS-3]",
            0xC1 => "DEVICE CONFIGURATION FREEZE LOCK [OBS-ACS-3]",
            0xC2 => "DEVICE CONFIGURATION IDENTIFY [OBS-ACS-3]",
            0xC3 => "DEVICE CONFIGURATION SET [OBS-ACS-3]",
            _ => "DEVICE CONFIGURATION [Reserved subcommand] [OBS-ACS-3]",
        },
        0xB4 => "SANITIZE DEVICE",
        0xB6 => "NV CACHE [OBS-ACS-3]",
        0xB7..=0xBB => RESERVED_CF,
        0xC0 => "CFA ERASE SECTORS [VS IF NO CFA]",
        0xC1..=0xC3 => VENDOR,
        0xC4 => "READ MULTIPLE",
        0xC5 => "WRITE MULTIPLE",
        0xC6 => "SET MULTIPLE MODE",
        0xC7 => "READ DMA QUEUED [OBS-ACS-2]",
        0xC8 => "READ DMA",
        0xC9 => "READ DMA (w/o retry) [OBS-5]",
        0xCA => "WRITE DMA",
        0xCB => "WRITE DMA (w/o retry) [OBS-5]",
        0xCC => "WRITE DMA QUEUED [OBS-ACS-2]",
        0xCD => "CFA WRITE MULTIPLE WITHOUT ERASE",
        0xCE => "WRITE MULTIPLE FUA EXT",
        0xD1 => "CHECK MEDIA CARD TYPE [OBS-ACS-2]",
        0xD2..=0xD4 => "[RESERVED FOR MEDIA CARD PASS THROUGH]",
        0xDA => "GET MEDIA STATUS [OBS-8]",
        0xDB => "ACKNOWLEDGE MEDIA CHANGE [RET-4]",
        0xDC => "BOOT POST-BOOT [RET-4]",
        0xDD => "BOOT PRE-BOOT [RET-4]",
        0xDE => "MEDIA LOCK [OBS-8]",
        0xDF => "MEDIA UNLOCK [OBS-8]",
        0xE0 => "STANDBY IMMEDIATE",
        0xE1 => "IDLE IMMEDIATE",
        0xE2 => "STANDBY",
        0xE3 => "IDLE",
        0xE4 => "READ BUFFER",
        0xE5 => "CHECK POWER MODE",
        0xE6 => "SLEEP",
        0xE7 => "FLUSH CACHE",
        0xE8 => "WRITE BUFFER",
        0xE9 => "READ BUFFER DMA",
        0xEA => "FLUSH CACHE EXT",
        0xEB => "WRITE BUFFER DMA",
        0xEC => "IDENTIFY DEVICE",
        0xED => "MEDIA EJECT [OBS-8]",
        0xEE => "IDENTIFY DEVICE DMA [OBS-4]",
        0xEF => match feature {
            0x02 => "SET FEATURES [Enable write cache]",
            0x03 => "SET FEATURES [Set transfer mode]",
            0x05 => "SET FEATURES [Enable APM]",
            0x06 => "SET FEATURES [Enable Pwr-Up In Standby]",
            0x07 => "SET FEATURES [Set device spin-up]",
            0x10 => "SET FEATURES [Enable SATA feature]",
            0x55 => "SET FEATURES [Disable read look-ahead]",
            0x82 => "SET FEATURES [Disable write cache]",
            0x85 => "SET FEATURES [Disable APM]",
            0x86 => "SET FEATURES [Disable Pwr-Up In Standby]",
            0x90 => "SET FEATURES [Disable SATA feature]",
            0xAA => "SET FEATURES [Enable read look-ahead]",
            0xCC => "SET FEATURES [Enable POR] [OBS-ACS-3]",
            _ => "SET FEATURES [Reserved subcommand]",
        },
        0xF1 => "SECURITY SET PASSWORD",
        0xF2 => "SECURITY UNLOCK",
        0xF3 => "SECURITY ERASE PREPARE",
        0xF4 => "SECURITY ERASE UNIT",
        0xF5 => "SECURITY FREEZE LOCK",
        0xF6 => "SECURITY DISABLE PASSWORD",
        0xF8 => "READ NATIVE MAX ADDRESS [OBS-ACS-3]",
        0xF9 => match feature {
            0x01 => "SET MAX SET PASSWORD [OBS-ACS-3]",
            0x02 => "SET MAX LOCK [OBS-ACS-3]",
            0x03 => "SET MAX UNLOCK [OBS-ACS-3]",
            0x04 => "SET MAX FREEZE LOCK [OBS-ACS-3]",
            _ => "SET MAX ADDRESS [OBS-ACS-3]",
        },
        0xF0 | 0xF7 | 0xFA..=0xFF => VENDOR,
        _ => RESERVED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_opcodes() {
        assert_eq!(command_name(0xEC, 0), "IDENTIFY DEVICE");
        assert_eq!(command_name(0xE5, 0), "CHECK POWER MODE");
        assert_eq!(command_name(0xA1, 0), "IDENTIFY PACKET DEVICE");
    }

    #[test]
    fn smart_subcommands() {
        assert_eq!(command_name(0xB0, 0xD0), "SMART READ DATA");
        assert_eq!(command_name(0xB0, 0xDA), "SMART RETURN STATUS");
        assert_eq!(command_name(0xB0, 0xD4), "SMART EXECUTE OFF-LINE IMMEDIATE");
        assert_eq!(command_name(0xB0, 0xE5), "SMART [Vendor specific subcommand]");
        assert_eq!(command_name(0xB0, 0x42), "SMART [Reserved subcommand]");
    }

    #[test]
    fn feature_ignored_for_plain_opcodes() {
        assert_eq!(command_name(0xEC, 0xD0), command_name(0xEC, 0x00));
    }

    #[test]
    fn reserved_and_vendor_ranges() {
        assert_eq!(command_name(0x02, 0), RESERVED);
        assert_eq!(command_name(0x80, 0), VENDOR);
        assert_eq!(command_name(0x66, 0), RESERVED_SA);
        assert_eq!(command_name(0xB8, 0), RESERVED_CF);
    }
}
