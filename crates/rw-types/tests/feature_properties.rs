//! Property-based tests for feature factories.

use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rw_types::*;

fn factories() -> Vec<FeatureFactory> {
    vec![
        FeatureFactory::WeightedFields(WeightedFieldsFactory::new(
            vec!["title".into(), "body".into(), "tags".into(), "brand".into()],
            vec![0.5, 2.0, 10.0],
        )),
        FeatureFactory::Float(FloatFactory::new(0.0, 1.0)),
        FeatureFactory::Choice(ChoiceFactory::new(vec!["AND".into(), "OR".into(), "75%".into()])),
        FeatureFactory::Template(TemplateFactory::new(vec![
            TemplateSpec::new("recip", "recip(ms(NOW,date),3.16e-11,{0},{1})", vec![
                ParamRange::new(0.1, 2.0),
                ParamRange::new(0.1, 2.0),
            ]),
            TemplateSpec::new("pop", "log(popularity)^{0}", vec![ParamRange::new(0.5, 3.0)]),
        ])),
        FeatureFactory::TemplateList(TemplateListFactory::new(vec![
            TemplateSpec::new("a", "a()^{0}", vec![ParamRange::new(1.0, 5.0)]),
            TemplateSpec::new("b", "b()^{0}", vec![ParamRange::new(1.0, 5.0)]),
        ])),
    ]
}

proptest! {
    #[test]
    fn zero_probability_mutation_is_identity(
        seed in any::<u64>(),
        amplitude in 0.0f64..1.0,
        which in 0usize..5
    ) {
        let factory = &factories()[which];
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let value = factory.random(&mut rng).unwrap();
        for _ in 0..10 {
            let mutated = factory.mutate(&value, 0.0, amplitude, &mut rng).unwrap();
            prop_assert_eq!(&mutated, &value);
        }
    }

    #[test]
    fn zero_amplitude_mutation_is_identity(seed in any::<u64>(), which in 0usize..5) {
        let factory = &factories()[which];
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let value = factory.random(&mut rng).unwrap();
        let mutated = factory.mutate(&value, 1.0, 0.0, &mut rng).unwrap();
        prop_assert_eq!(mutated, value);
    }

    #[test]
    fn float_mutation_stays_in_domain(
        seed in any::<u64>(),
        start in 0.0f64..1.0,
        amplitude in 0.0f64..1.0
    ) {
        let factory = FloatFactory::new(0.0, 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let value = factory.mutate(start, 1.0, amplitude, &mut rng);
        prop_assert!((0.0..=1.0).contains(&value));
    }

    #[test]
    fn permute_respects_cap(max_count in 0usize..40, which in 0usize..5) {
        let factory = &factories()[which];
        prop_assert!(factory.permute(max_count).len() <= max_count);
    }
}
