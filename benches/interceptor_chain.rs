use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use permify_server::authn::{Authenticator, KeyAuthn};
use permify_server::middleware::{AuthInterceptor, InterceptorChain, RateLimiter};
use permify_server::proto::{
    Entity, PermissionCheckRequest, PermissionCheckRequestMetadata, Subject,
};
use permify_server::validation::Validate;
use tonic::{Request, Status};

fn check_request() -> PermissionCheckRequest {
    PermissionCheckRequest {
        tenant_id: "t1".to_string(),
        metadata: Some(PermissionCheckRequestMetadata {
            depth: 20,
            ..Default::default()
        }),
        entity: Some(Entity {
            r#type: "document".to_string(),
            id: "1".to_string(),
        }),
        permission: "view".to_string(),
        subject: Some(Subject {
            r#type: "user".to_string(),
            id: "alice".to_string(),
            relation: String::new(),
        }),
    }
}

fn bench_validation(c: &mut Criterion) {
    let request = check_request();

    c.bench_function("validate_check_request", |b| {
        b.iter(|| black_box(&request).validate().unwrap())
    });
}

fn bench_rate_limiter(c: &mut Criterion) {
    let limiter = RateLimiter::new(u32::MAX as u64);

    c.bench_function("rate_limiter_admit", |b| {
        b.iter(|| limiter.check_rate_limit().unwrap())
    });
}

fn bench_unary_chain(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let plain = InterceptorChain::compose(RateLimiter::new(u32::MAX as u64), None);
    let authn = Authenticator::Preshared(KeyAuthn::new(&["bench-key".to_string()]).unwrap());
    let guarded = InterceptorChain::compose(
        RateLimiter::new(u32::MAX as u64),
        Some(AuthInterceptor::new(authn)),
    );

    c.bench_function("unary_chain_without_auth", |b| {
        b.to_async(&runtime).iter(|| async {
            plain
                .unary(
                    "/base.v1.Permission/Check",
                    Request::new(check_request()),
                    |req| async move { Ok::<_, Status>(req.permission.len()) },
                )
                .await
                .unwrap()
        })
    });

    c.bench_function("unary_chain_with_preshared_auth", |b| {
        b.to_async(&runtime).iter(|| async {
            let mut request = Request::new(check_request());
            request
                .metadata_mut()
                .insert("authorization", "Bearer bench-key".parse().unwrap());
            guarded
                .unary(
                    "/base.v1.Permission/Check",
                    request,
                    |req| async move { Ok::<_, Status>(req.permission.len()) },
                )
                .await
                .unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_validation,
    bench_rate_limiter,
    bench_unary_chain
);
criterion_main!(benches);
