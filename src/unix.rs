//! The system GSS-API library (MIT krb5 or Heimdal) as a [`SecurityProvider`].

use std::{ffi::c_int, ptr::null_mut, sync::Arc};

use libgssapi_sys::{
    gss_OID, gss_OID_set, gss_accept_sec_context, gss_acquire_cred, gss_add_cred, gss_canonicalize_name,
    gss_compare_name, gss_cred_id_t, gss_ctx_id_t, gss_delete_sec_context, gss_display_name, gss_duplicate_name,
    gss_export_name, gss_get_mic, gss_import_name, gss_indicate_mechs, gss_init_sec_context, gss_inquire_context,
    gss_inquire_cred, gss_inquire_cred_by_mech, gss_inquire_mechs_for_name, gss_inquire_names_for_mech,
    gss_name_t, gss_release_cred, gss_release_name, gss_unwrap, gss_verify_mic, gss_wrap, GSS_C_ACCEPT, GSS_C_BOTH,
    GSS_C_INITIATE,
};

use crate::{
    buffer::ProviderAllocation,
    channel_bindings::ChannelBindings,
    credentials::CredentialUsage,
    error::{MajorStatus, ProviderError},
    oid::{Oid, OidSet},
    provider::{
        AcceptContextArgs, AcquiredCredential, AddedCredential, ContextStep, InitContextArgs, Provider, RawContextInfo,
        RawCredentialInfo, RawDisplayName, RawHandle, RawMechanismCredentialInfo, RawUnwrapped, RawWrapped,
        SecurityProvider,
    },
    settings::{requested_secs, ContextFlags, Lifetime, Qop},
};

mod buffer;
mod error;
mod oid;

use buffer::{channel_bindings, input_desc, GssBuffer};
use error::check;
use oid::{copy_oid, take_oid_set, BorrowedOid, BorrowedOidSet};

/// Binds the GSS-API library the process is linked against.
///
/// Configuration comes from the environment the library reads (`KRB5_CONFIG`,
/// `KRB5_KTNAME`, the credential cache); see [`crate::config::Krb5Environment`].
#[derive(Debug, Default)]
pub struct GssapiProvider;
impl GssapiProvider {
    pub fn new() -> Self {
        Self
    }
    pub fn shared() -> Provider {
        Arc::new(Self)
    }
}

fn usage_to_c(usage: CredentialUsage) -> c_int {
    match usage {
        CredentialUsage::Initiate => GSS_C_INITIATE as c_int,
        CredentialUsage::Accept => GSS_C_ACCEPT as c_int,
        CredentialUsage::Both => GSS_C_BOTH as c_int,
    }
}

fn usage_from_c(usage: c_int) -> CredentialUsage {
    match usage {
        u if u == GSS_C_INITIATE as c_int => CredentialUsage::Initiate,
        u if u == GSS_C_ACCEPT as c_int => CredentialUsage::Accept,
        _ => CredentialUsage::Both,
    }
}

fn handle_ptr<T>(handle: Option<RawHandle>) -> *mut T {
    handle.map_or(null_mut(), RawHandle::as_ptr)
}

/// The library returned success without the handle it promised.
fn missing(what: &str) -> ProviderError {
    ProviderError::failure(format!("GSS-API returned no {what}"))
}

fn optional_oid(oid: Option<&Oid>) -> Result<Option<BorrowedOid<'_>>, ProviderError> {
    oid.map(BorrowedOid::new).transpose()
}

fn name_handle(name: gss_name_t) -> Option<RawHandle> {
    RawHandle::from_ptr(name)
}

impl SecurityProvider for GssapiProvider {
    fn acquire_credential(
        &self,
        name: Option<RawHandle>,
        lifetime: Option<Lifetime>,
        mechanisms: Option<&OidSet>,
        usage: CredentialUsage,
    ) -> Result<AcquiredCredential, ProviderError> {
        let mut desired = mechanisms.map(BorrowedOidSet::new).transpose()?;
        let mut minor = 0;
        let mut credential: gss_cred_id_t = null_mut();
        let mut actual: gss_OID_set = null_mut();
        let mut time_rec = 0;
        let major = unsafe {
            gss_acquire_cred(
                &mut minor,
                handle_ptr(name),
                requested_secs(lifetime),
                desired.as_mut().map_or(null_mut(), BorrowedOidSet::as_ptr),
                usage_to_c(usage),
                &mut credential,
                &mut actual,
                &mut time_rec,
            )
        };
        let mechanisms = unsafe { take_oid_set(actual) };
        check(major, minor)?;
        Ok(AcquiredCredential {
            handle: RawHandle::from_ptr(credential).ok_or_else(|| missing("credential"))?,
            mechanisms,
            lifetime: Lifetime::from_secs(time_rec),
        })
    }

    fn add_credential(
        &self,
        credential: RawHandle,
        name: Option<RawHandle>,
        mechanism: &Oid,
        usage: CredentialUsage,
        initiator_lifetime: Option<Lifetime>,
        acceptor_lifetime: Option<Lifetime>,
    ) -> Result<AddedCredential, ProviderError> {
        let mut mechanism = BorrowedOid::new(mechanism)?;
        let mut minor = 0;
        let mut output: gss_cred_id_t = null_mut();
        let mut actual: gss_OID_set = null_mut();
        let (mut initiator_rec, mut acceptor_rec) = (0, 0);
        let major = unsafe {
            gss_add_cred(
                &mut minor,
                credential.as_ptr(),
                handle_ptr(name),
                mechanism.as_ptr(),
                usage_to_c(usage),
                requested_secs(initiator_lifetime),
                requested_secs(acceptor_lifetime),
                &mut output,
                &mut actual,
                &mut initiator_rec,
                &mut acceptor_rec,
            )
        };
        let mechanisms = unsafe { take_oid_set(actual) };
        check(major, minor)?;
        Ok(AddedCredential {
            handle: RawHandle::from_ptr(output).ok_or_else(|| missing("credential"))?,
            mechanisms,
            initiator_lifetime: Lifetime::from_secs(initiator_rec),
            acceptor_lifetime: Lifetime::from_secs(acceptor_rec),
        })
    }

    fn inquire_credential(&self, credential: RawHandle) -> Result<RawCredentialInfo, ProviderError> {
        let mut minor = 0;
        let mut name: gss_name_t = null_mut();
        let mut lifetime = 0;
        let mut usage: c_int = 0;
        let mut mechanisms: gss_OID_set = null_mut();
        let major = unsafe {
            gss_inquire_cred(
                &mut minor,
                credential.as_ptr(),
                &mut name,
                &mut lifetime,
                &mut usage,
                &mut mechanisms,
            )
        };
        let mechanisms = unsafe { take_oid_set(mechanisms) };
        check(major, minor)?;
        Ok(RawCredentialInfo {
            name: name_handle(name),
            lifetime: Lifetime::from_secs(lifetime),
            usage: usage_from_c(usage),
            mechanisms,
        })
    }

    fn inquire_credential_by_mech(
        &self,
        credential: RawHandle,
        mechanism: &Oid,
    ) -> Result<RawMechanismCredentialInfo, ProviderError> {
        let mut mechanism = BorrowedOid::new(mechanism)?;
        let mut minor = 0;
        let mut name: gss_name_t = null_mut();
        let (mut initiator, mut acceptor) = (0, 0);
        let mut usage: c_int = 0;
        let major = unsafe {
            gss_inquire_cred_by_mech(
                &mut minor,
                credential.as_ptr(),
                mechanism.as_ptr(),
                &mut name,
                &mut initiator,
                &mut acceptor,
                &mut usage,
            )
        };
        check(major, minor)?;
        Ok(RawMechanismCredentialInfo {
            name: name_handle(name),
            initiator_lifetime: Lifetime::from_secs(initiator),
            acceptor_lifetime: Lifetime::from_secs(acceptor),
            usage: usage_from_c(usage),
        })
    }

    fn release_credential(&self, credential: RawHandle) -> Result<(), ProviderError> {
        let mut minor = 0;
        let mut credential: gss_cred_id_t = credential.as_ptr();
        let major = unsafe { gss_release_cred(&mut minor, &mut credential) };
        check(major, minor).map(drop)
    }

    fn init_sec_context(
        &self,
        context: &mut Option<RawHandle>,
        args: InitContextArgs<'_>,
    ) -> Result<ContextStep, ProviderError> {
        let mut mechanism = optional_oid(args.mechanism)?;
        let mut bindings = args.channel_bindings.map(ChannelBindings::application_data).map(channel_bindings);
        let mut input = input_desc(args.input_token.unwrap_or_default());
        let mut output = GssBuffer::empty();
        let mut ctx: gss_ctx_id_t = handle_ptr(*context);
        let mut minor = 0;
        let mut actual_mech: gss_OID = null_mut();
        let mut flags = 0;
        let mut time_rec = 0;
        let major = unsafe {
            gss_init_sec_context(
                &mut minor,
                handle_ptr(args.credential),
                &mut ctx,
                args.target.as_ptr(),
                mechanism.as_mut().map_or(null_mut(), BorrowedOid::as_ptr),
                args.flags.bits(),
                requested_secs(args.lifetime),
                bindings.as_mut().map_or(null_mut(), std::ptr::from_mut),
                &mut input,
                &mut actual_mech,
                output.as_mut_ptr(),
                &mut flags,
                &mut time_rec,
            )
        };
        *context = RawHandle::from_ptr(ctx);
        let status = check(major, minor)?;
        Ok(ContextStep {
            continue_needed: status.continue_needed(),
            output_token: Some(output.boxed()),
            mechanism: unsafe { copy_oid(actual_mech) },
            flags: ContextFlags::from_bits_truncate(flags),
            lifetime: Lifetime::from_secs(time_rec),
            source: None,
            delegated: None,
        })
    }

    fn accept_sec_context(
        &self,
        context: &mut Option<RawHandle>,
        args: AcceptContextArgs<'_>,
    ) -> Result<ContextStep, ProviderError> {
        let mut bindings = args.channel_bindings.map(ChannelBindings::application_data).map(channel_bindings);
        let mut input = input_desc(args.input_token);
        let mut output = GssBuffer::empty();
        let mut ctx: gss_ctx_id_t = handle_ptr(*context);
        let mut minor = 0;
        let mut source: gss_name_t = null_mut();
        let mut mech: gss_OID = null_mut();
        let mut flags = 0;
        let mut time_rec = 0;
        let mut delegated: gss_cred_id_t = null_mut();
        let major = unsafe {
            gss_accept_sec_context(
                &mut minor,
                &mut ctx,
                handle_ptr(args.credential),
                &mut input,
                bindings.as_mut().map_or(null_mut(), std::ptr::from_mut),
                &mut source,
                &mut mech,
                output.as_mut_ptr(),
                &mut flags,
                &mut time_rec,
                &mut delegated,
            )
        };
        *context = RawHandle::from_ptr(ctx);
        let status = check(major, minor)?;
        Ok(ContextStep {
            continue_needed: status.continue_needed(),
            output_token: Some(output.boxed()),
            mechanism: unsafe { copy_oid(mech) },
            flags: ContextFlags::from_bits_truncate(flags),
            lifetime: Lifetime::from_secs(time_rec),
            source: name_handle(source),
            delegated: RawHandle::from_ptr(delegated),
        })
    }

    fn delete_sec_context(&self, context: RawHandle) -> Result<(), ProviderError> {
        let mut minor = 0;
        let mut ctx: gss_ctx_id_t = context.as_ptr();
        let major = unsafe { gss_delete_sec_context(&mut minor, &mut ctx, null_mut()) };
        check(major, minor).map(drop)
    }

    fn inquire_context(&self, context: RawHandle) -> Result<RawContextInfo, ProviderError> {
        let mut minor = 0;
        let mut source: gss_name_t = null_mut();
        let mut target: gss_name_t = null_mut();
        let mut lifetime = 0;
        let mut mech: gss_OID = null_mut();
        let mut flags = 0;
        let mut locally_initiated: c_int = 0;
        let mut open: c_int = 0;
        let major = unsafe {
            gss_inquire_context(
                &mut minor,
                context.as_ptr(),
                &mut source,
                &mut target,
                &mut lifetime,
                &mut mech,
                &mut flags,
                &mut locally_initiated,
                &mut open,
            )
        };
        check(major, minor)?;
        Ok(RawContextInfo {
            source: name_handle(source),
            target: name_handle(target),
            lifetime: Lifetime::from_secs(lifetime),
            mechanism: unsafe { copy_oid(mech) },
            flags: ContextFlags::from_bits_truncate(flags),
            locally_initiated: locally_initiated != 0,
            open: open != 0,
        })
    }

    fn import_name(&self, name: &[u8], name_type: &Oid) -> Result<RawHandle, ProviderError> {
        let mut name_type = BorrowedOid::new(name_type)?;
        let mut buffer = input_desc(name);
        let mut minor = 0;
        let mut output: gss_name_t = null_mut();
        let major = unsafe { gss_import_name(&mut minor, &mut buffer, name_type.as_ptr(), &mut output) };
        check(major, minor)?;
        name_handle(output).ok_or_else(|| missing("name"))
    }

    fn canonicalize_name(&self, name: RawHandle, mechanism: &Oid) -> Result<RawHandle, ProviderError> {
        let mut mechanism = BorrowedOid::new(mechanism)?;
        let mut minor = 0;
        let mut output: gss_name_t = null_mut();
        let major = unsafe { gss_canonicalize_name(&mut minor, name.as_ptr(), mechanism.as_ptr(), &mut output) };
        check(major, minor)?;
        name_handle(output).ok_or_else(|| missing("name"))
    }

    fn compare_name(&self, first: RawHandle, second: RawHandle) -> Result<bool, ProviderError> {
        let mut minor = 0;
        let mut equal: c_int = 0;
        let major = unsafe { gss_compare_name(&mut minor, first.as_ptr(), second.as_ptr(), &mut equal) };
        check(major, minor)?;
        Ok(equal != 0)
    }

    fn display_name(&self, name: RawHandle) -> Result<RawDisplayName, ProviderError> {
        let mut minor = 0;
        let mut output = GssBuffer::empty();
        let mut name_type: gss_OID = null_mut();
        let major = unsafe { gss_display_name(&mut minor, name.as_ptr(), output.as_mut_ptr(), &mut name_type) };
        check(major, minor)?;
        Ok(RawDisplayName {
            text: String::from_utf8_lossy(output.as_slice()).into_owned(),
            name_type: unsafe { copy_oid(name_type) },
        })
    }

    fn export_name(&self, name: RawHandle) -> Result<Box<dyn ProviderAllocation>, ProviderError> {
        let mut minor = 0;
        let mut output = GssBuffer::empty();
        let major = unsafe { gss_export_name(&mut minor, name.as_ptr(), output.as_mut_ptr()) };
        check(major, minor)?;
        Ok(output.boxed())
    }

    fn duplicate_name(&self, name: RawHandle) -> Result<RawHandle, ProviderError> {
        let mut minor = 0;
        let mut output: gss_name_t = null_mut();
        let major = unsafe { gss_duplicate_name(&mut minor, name.as_ptr(), &mut output) };
        check(major, minor)?;
        name_handle(output).ok_or_else(|| missing("name"))
    }

    fn release_name(&self, name: RawHandle) -> Result<(), ProviderError> {
        let mut minor = 0;
        let mut name: gss_name_t = name.as_ptr();
        let major = unsafe { gss_release_name(&mut minor, &mut name) };
        check(major, minor).map(drop)
    }

    fn inquire_mechs_for_name(&self, name: RawHandle) -> Result<OidSet, ProviderError> {
        let mut minor = 0;
        let mut set: gss_OID_set = null_mut();
        let major = unsafe { gss_inquire_mechs_for_name(&mut minor, name.as_ptr(), &mut set) };
        let set = unsafe { take_oid_set(set) };
        check(major, minor)?;
        Ok(set)
    }

    fn inquire_names_for_mech(&self, mechanism: &Oid) -> Result<OidSet, ProviderError> {
        let mut mechanism = BorrowedOid::new(mechanism)?;
        let mut minor = 0;
        let mut set: gss_OID_set = null_mut();
        let major = unsafe { gss_inquire_names_for_mech(&mut minor, mechanism.as_ptr(), &mut set) };
        let set = unsafe { take_oid_set(set) };
        check(major, minor)?;
        Ok(set)
    }

    fn indicate_mechs(&self) -> Result<OidSet, ProviderError> {
        let mut minor = 0;
        let mut set: gss_OID_set = null_mut();
        let major = unsafe { gss_indicate_mechs(&mut minor, &mut set) };
        let set = unsafe { take_oid_set(set) };
        check(major, minor)?;
        Ok(set)
    }

    fn get_mic(
        &self,
        context: RawHandle,
        qop: Qop,
        message: &[u8],
    ) -> Result<Box<dyn ProviderAllocation>, ProviderError> {
        let mut input = input_desc(message);
        let mut output = GssBuffer::empty();
        let mut minor = 0;
        let major = unsafe { gss_get_mic(&mut minor, context.as_ptr(), qop.0, &mut input, output.as_mut_ptr()) };
        check(major, minor)?;
        Ok(output.boxed())
    }

    fn verify_mic(&self, context: RawHandle, message: &[u8], mic: &[u8]) -> Result<Qop, ProviderError> {
        let mut message = input_desc(message);
        let mut token = input_desc(mic);
        let mut minor = 0;
        let mut qop = 0;
        let major = unsafe { gss_verify_mic(&mut minor, context.as_ptr(), &mut message, &mut token, &mut qop) };
        check(major, minor)?;
        Ok(Qop(qop))
    }

    fn wrap(
        &self,
        context: RawHandle,
        confidential: bool,
        qop: Qop,
        message: &[u8],
    ) -> Result<RawWrapped, ProviderError> {
        let mut input = input_desc(message);
        let mut output = GssBuffer::empty();
        let mut minor = 0;
        let mut conf_state: c_int = 0;
        let major = unsafe {
            gss_wrap(
                &mut minor,
                context.as_ptr(),
                c_int::from(confidential),
                qop.0,
                &mut input,
                &mut conf_state,
                output.as_mut_ptr(),
            )
        };
        check(major, minor)?;
        Ok(RawWrapped {
            token: output.boxed(),
            confidential: conf_state != 0,
        })
    }

    fn unwrap(&self, context: RawHandle, token: &[u8]) -> Result<RawUnwrapped, ProviderError> {
        let mut input = input_desc(token);
        let mut output = GssBuffer::empty();
        let mut minor = 0;
        let mut conf_state: c_int = 0;
        let mut qop = 0;
        let major = unsafe {
            gss_unwrap(
                &mut minor,
                context.as_ptr(),
                &mut input,
                output.as_mut_ptr(),
                &mut conf_state,
                &mut qop,
            )
        };
        let status = check(major, minor)?;
        if status.0 & MajorStatus::DUPLICATE_TOKEN.0 != 0 {
            return Err(ProviderError::new(MajorStatus::DUPLICATE_TOKEN, minor, "replayed wrap token"));
        }
        Ok(RawUnwrapped {
            message: output.boxed(),
            confidential: conf_state != 0,
            qop: Qop(qop),
        })
    }
}
