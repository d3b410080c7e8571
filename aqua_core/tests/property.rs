use aqua_core::protocol::{
    Command, CommandParser, DeviceLine, LightForce, PROTOCOL_VERSION, TelemetryFrame, decode_line,
    encode_status,
};
use proptest::prelude::*;

prop_compose! {
    fn frame_strategy()(
        uptime in any::<u32>(),
        clock in 0u32..864_000,
        loops in any::<u32>(),
        temp_x16 in any::<u16>(),
        update_id in any::<u8>(),
        co2 in any::<u16>(),
        flags in any::<[bool; 8]>(),
        forces in any::<u8>(),
        adc_accum in any::<u32>(),
        adc_samples in any::<u16>(),
    ) -> TelemetryFrame {
        let mut f = TelemetryFrame { version: PROTOCOL_VERSION, ..TelemetryFrame::default() };
        f.diagnostics.uptime_ds = uptime;
        f.diagnostics.main_loop_iterations = loops;
        f.diagnostics.clock_ds_since_midnight = clock;
        f.aquarium_temperature.temperature_x16 = temp_x16;
        f.aquarium_temperature.update_id = update_id;
        f.case_temperature.temperature_x16 = temp_x16 / 2;
        f.co2.concentration = co2;
        f.co2.valve_open = flags[0];
        f.co2.calculated_day = flags[1];
        f.co2.force_off = flags[2];
        f.co2.required_open = flags[3];
        f.light.day_on = flags[4];
        f.light.night_on = flags[5];
        f.light.day_forced = flags[6];
        f.light.night_forced = flags[7];
        f.light.forces = forces;
        f.ph.adc_accum = adc_accum;
        f.ph.adc_samples = adc_samples;
        f
    }
}

fn command_strategy() -> impl Strategy<Value = Command> {
    prop_oneof![
        Just(Command::ForceCo2Off),
        any::<bool>().prop_map(Command::RequiredCo2Valve),
        prop_oneof![
            Just(LightForce::NotForced),
            Just(LightForce::Day),
            Just(LightForce::Night)
        ]
        .prop_map(Command::Light),
        any::<u8>().prop_map(Command::Clock0),
        any::<u8>().prop_map(Command::Clock1),
        any::<u8>().prop_map(Command::Clock2),
    ]
}

proptest! {
    #[test]
    fn decode_never_panics(line in ".{0,200}") {
        let _ = decode_line(&line);
    }

    #[test]
    fn encoded_frames_decode_back(frame in frame_strategy()) {
        let line = encode_status(&frame);
        prop_assert!(line.ends_with("\r\n"));
        prop_assert_eq!(decode_line(&line), Ok(DeviceLine::Status(frame)));
    }

    #[test]
    fn single_corrupted_byte_never_yields_a_different_frame(
        frame in frame_strategy(),
        at in any::<prop::sample::Index>(),
        xor in 1u8..=0x7F,
    ) {
        let line = encode_status(&frame);
        let mut bytes = line.trim_end_matches("\r\n").as_bytes().to_vec();
        let i = at.index(bytes.len());
        bytes[i] ^= xor;
        if let Ok(text) = std::str::from_utf8(&bytes)
            && let Ok(DeviceLine::Status(got)) = decode_line(text)
        {
            prop_assert_eq!(got, frame);
        }
    }

    #[test]
    fn parser_recovers_commands_after_noise(
        noise in proptest::collection::vec(any::<u8>(), 0..64),
        cmds in proptest::collection::vec(command_strategy(), 1..8),
    ) {
        let mut p = CommandParser::new();
        let _ = p.feed(&noise);
        let wire: String = cmds.iter().map(Command::encode).collect();
        let got = p.feed(wire.as_bytes());
        // Leftover noise can swallow at most the first command.
        prop_assert!(got.len() + 1 >= cmds.len());
        prop_assert_eq!(&got[got.len() - (cmds.len() - 1)..], &cmds[1..]);
    }
}
